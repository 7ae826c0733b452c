//! `kiln build`: incremental compile and link.
//!
//! 1. Find the project root and load `kiln.toml`
//! 2. Discover `*.kl` sources and build the module graph
//! 3. Run the incremental rebuild
//! 4. Write the linked artifact
//! 5. Report rebuilt modules, or the failures

use kiln_cache::{BuildError, BuildReport, BuildSettings, ModuleFailure, ModuleReport};
use kiln_lang::KilnCompiler;
use tracing::debug;

use crate::pipeline::resolve_project_root;
use crate::{BuildArgs, GlobalArgs, ReportFormat};

/// Runs the `kiln build` command.
///
/// Returns exit code 0 if every module built, 1 if any module failed or was
/// skipped.
pub fn run(args: &BuildArgs, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let project_dir = resolve_project_root(global)?;
    let config = kiln_config::load_config(&project_dir)?;
    let text = args.format == ReportFormat::Text;

    if !global.quiet && text {
        eprintln!(
            "   Building {} v{}",
            config.project.name, config.project.version
        );
    }

    let graph = kiln_lang::module_graph(&config, &project_dir)?;
    debug!(modules = graph.len(), "loaded module graph");
    let settings = BuildSettings::new(config.cache_dir(&project_dir))
        .with_jobs(args.jobs.unwrap_or(config.build.jobs));

    match kiln_cache::rebuild_all(KilnCompiler::new(), &graph, settings) {
        Ok(output) => {
            let output_path = config.output_path(&project_dir);
            output.artifact.write_to(&output_path)?;
            debug!(path = %output_path.display(), "wrote linked artifact");

            match args.format {
                ReportFormat::Json => println!("{}", output.report.to_json()?),
                ReportFormat::Text if !global.quiet => {
                    for module in &output.report.modules {
                        print_module(module, args.explain);
                    }
                    eprintln!(
                        "    Finished {} unit(s) compiled, {} module(s) rebuilt",
                        output.report.compiled_count(),
                        output.rebuilt_modules.len()
                    );
                    eprintln!("     Linked {}", output_path.display());
                }
                ReportFormat::Text => {}
            }
            Ok(0)
        }
        Err(BuildError::Failed(report)) | Err(BuildError::Cancelled(report)) => {
            match args.format {
                ReportFormat::Json => println!("{}", report.to_json()?),
                ReportFormat::Text => print_failure(&report, args.explain, global.quiet),
            }
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}

fn print_module(module: &ModuleReport, explain: bool) {
    let compiled = module.compiled_units().count();
    if compiled > 0 {
        eprintln!(
            "  Compiling {} ({} of {} units)",
            module.name,
            compiled,
            module.units.len()
        );
    } else {
        eprintln!("      Fresh {}", module.name);
    }
    if explain {
        for unit in &module.units {
            eprintln!("             {}: {}", unit.unit, unit.state);
        }
    }
}

fn print_failure(report: &BuildReport, explain: bool, quiet: bool) {
    for module in &report.modules {
        match &module.failure {
            None => {
                if !quiet {
                    print_module(module, explain);
                }
            }
            Some(ModuleFailure::Compile { units }) => {
                for failure in units {
                    eprintln!("error[{}]: {}: {}", module.name, failure.unit, failure.error);
                }
            }
            Some(ModuleFailure::Skipped { upstream }) => {
                if !quiet {
                    eprintln!(
                        "    Skipped {} (upstream failed: {})",
                        module.name,
                        upstream.join(", ")
                    );
                }
            }
            Some(ModuleFailure::Cancelled) => {
                if !quiet {
                    eprintln!("  Cancelled {}", module.name);
                }
            }
            Some(ModuleFailure::Cache { message }) => {
                eprintln!("error[{}]: {message}", module.name);
            }
        }
    }
    eprintln!(
        "   Result: {} unit(s) failed, {} module(s) skipped",
        report.failed_units().len(),
        report.skipped_modules().len()
    );
}
