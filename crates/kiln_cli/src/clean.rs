//! `kiln clean`: removes the cache directory.

use crate::pipeline::resolve_project_root;
use crate::GlobalArgs;

/// Runs the `kiln clean` command.
///
/// A missing cache directory is not an error.
pub fn run(global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let project_dir = resolve_project_root(global)?;
    let config = kiln_config::load_config(&project_dir)?;
    let cache_dir = config.cache_dir(&project_dir);

    match std::fs::remove_dir_all(&cache_dir) {
        Ok(()) => {
            if !global.quiet {
                eprintln!("    Removed {}", cache_dir.display());
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(format!("failed to remove {}: {e}", cache_dir.display()).into()),
    }
    Ok(0)
}
