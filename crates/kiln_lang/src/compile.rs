//! The kiln implementation of the single-unit compile.
//!
//! A unit compiles to a canonical text lowering with one line per
//! declaration. Declarations are fingerprinted from their shape only, and
//! every name a unit uses from its own module or a dependency is reported as
//! a reference so the cache can invalidate it precisely.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;

use kiln_cache::{
    CompileError, CompiledUnit, DeclarationKind, DeclarationRecord, DeclarationShape,
    ModuleContext, Reference, SourceUnit, UnitCompiler, Visibility,
};
use tracing::trace;

use crate::ast::{Item, ItemKind, SourceFile, TypeRef};
use crate::eval::{evaluate, Value};
use crate::parser::parse;
use crate::token::{is_keyword, Token, TokenKind, BUILTIN_TYPES};

/// Option that adds source line markers to the lowered output.
pub const DEBUG_OPTION: &str = "debug";

/// Compiles kiln source units.
#[derive(Clone, Copy, Debug, Default)]
pub struct KilnCompiler;

impl KilnCompiler {
    /// Creates a compiler.
    pub fn new() -> Self {
        Self
    }
}

impl UnitCompiler for KilnCompiler {
    fn compile_unit(
        &self,
        unit: &SourceUnit,
        source: &[u8],
        ctx: &ModuleContext,
    ) -> Result<CompiledUnit, CompileError> {
        let text = std::str::from_utf8(source)
            .map_err(|e| CompileError::new(format!("source is not valid UTF-8: {e}")))?;
        let file = parse(text)?;
        check_unique(&file)?;

        let constants = evaluate_constants(&file)?;
        let local: HashSet<&str> = file.items.iter().map(|i| i.name.as_str()).collect();

        let mut references = BTreeSet::new();
        let mut declarations = Vec::with_capacity(file.items.len());
        for item in &file.items {
            for reference in item_references(item, &local, &ctx.module) {
                resolve(&reference, item.line, ctx)?;
                references.insert(reference);
            }
            declarations.push(DeclarationRecord {
                name: item.name.clone(),
                fingerprint: shape(item, &constants).fingerprint(),
                visibility: item.visibility,
            });
        }

        trace!(
            unit = %unit.id,
            declarations = declarations.len(),
            references = references.len(),
            "compiled unit"
        );
        Ok(CompiledUnit {
            artifact: lower(unit, &file, &constants, ctx).into_bytes(),
            declarations,
            references: references.into_iter().collect(),
        })
    }
}

fn check_unique(file: &SourceFile) -> Result<(), CompileError> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for item in &file.items {
        if let Some(first) = seen.insert(&item.name, item.line) {
            return Err(CompileError::at_line(
                item.line,
                format!(
                    "duplicate declaration '{}', first declared on line {first}",
                    item.name
                ),
            ));
        }
    }
    Ok(())
}

fn evaluate_constants(file: &SourceFile) -> Result<HashMap<String, Value>, CompileError> {
    let mut known = HashMap::new();
    for item in &file.items {
        if let ItemKind::Constant { ty, value } = &item.kind {
            let evaluated = evaluate(value, item.line, &known)?;
            let ty = ty.to_string();
            if !evaluated.fits(&ty) {
                return Err(CompileError::at_line(
                    item.line,
                    format!(
                        "constant '{}' is declared as {ty} but its value is a {}",
                        item.name,
                        evaluated.type_name()
                    ),
                ));
            }
            known.insert(item.name.clone(), evaluated);
        }
    }
    Ok(known)
}

/// Every declaration `item` uses outside its own unit.
fn item_references(item: &Item, local: &HashSet<&str>, module: &str) -> BTreeSet<Reference> {
    let mut refs = BTreeSet::new();
    match &item.kind {
        ItemKind::Function { params, ret, body } => {
            let mut bound: HashSet<&str> = params.iter().map(|p| p.name.as_str()).collect();
            for param in params {
                refs.extend(type_reference(&param.ty, local, module));
                if let Some(default) = &param.default {
                    body_references(default, &bound, local, module, &mut refs);
                }
            }
            if let Some(ret) = ret {
                refs.extend(type_reference(ret, local, module));
            }
            bound.extend(let_bindings(body));
            body_references(body, &bound, local, module, &mut refs);
        }
        ItemKind::Constant { ty, .. } => refs.extend(type_reference(ty, local, module)),
        ItemKind::Type { definition } => refs.extend(type_reference(definition, local, module)),
    }
    refs
}

fn type_reference(ty: &TypeRef, local: &HashSet<&str>, module: &str) -> Option<Reference> {
    match ty {
        TypeRef::Qualified { module: m, name } => Some(Reference::new(m, name)),
        TypeRef::Named(name) if BUILTIN_TYPES.contains(&name.as_str()) => None,
        TypeRef::Named(name) if local.contains(name.as_str()) => None,
        TypeRef::Named(name) => Some(Reference::new(module, name)),
    }
}

/// Names introduced by `let name` inside a body.
fn let_bindings(body: &[Token]) -> impl Iterator<Item = &str> {
    body.windows(2).filter_map(|pair| match (&pair[0].kind, &pair[1].kind) {
        (TokenKind::Ident(kw), TokenKind::Ident(name)) if kw == "let" => Some(name.as_str()),
        _ => None,
    })
}

fn body_references(
    tokens: &[Token],
    bound: &HashSet<&str>,
    local: &HashSet<&str>,
    module: &str,
    refs: &mut BTreeSet<Reference>,
) {
    for (i, token) in tokens.iter().enumerate() {
        match &token.kind {
            TokenKind::Path(m, name) => {
                refs.insert(Reference::new(m, name));
            }
            TokenKind::Ident(name) => {
                let field_access = i > 0 && tokens[i - 1].is_punct('.');
                if !field_access
                    && !is_keyword(name)
                    && !bound.contains(name.as_str())
                    && !local.contains(name.as_str())
                    && !BUILTIN_TYPES.contains(&name.as_str())
                {
                    refs.insert(Reference::new(module, name));
                }
            }
            _ => {}
        }
    }
}

/// Checks that a reference into another module is visible from `ctx`.
fn resolve(reference: &Reference, line: usize, ctx: &ModuleContext) -> Result<(), CompileError> {
    let module = reference.module.as_str();
    if module == ctx.module {
        return Ok(());
    }
    if !ctx.depends_on(module) {
        return Err(CompileError::at_line(
            line,
            format!(
                "'{reference}' refers to module '{module}', which is not a dependency of '{}'",
                ctx.module
            ),
        ));
    }
    let Some(decl) = ctx.lookup(module, &reference.declaration) else {
        return Err(CompileError::at_line(
            line,
            format!("unresolved reference '{reference}'"),
        ));
    };
    match decl.visibility {
        Visibility::Public => Ok(()),
        Visibility::Internal if ctx.is_friend(module) => Ok(()),
        Visibility::Internal => Err(CompileError::at_line(
            line,
            format!(
                "'{reference}' is internal to '{module}' and '{}' is not a friend",
                ctx.module
            ),
        )),
        Visibility::Private => Err(CompileError::at_line(
            line,
            format!("'{reference}' is private to '{module}'"),
        )),
    }
}

fn shape(item: &Item, constants: &HashMap<String, Value>) -> DeclarationShape {
    let (kind, signature, parameter_defaults, constant_value) = match &item.kind {
        ItemKind::Function { params, ret, .. } => {
            let defaults = params.iter().map(|p| p.default.is_some()).collect();
            let params: Vec<String> = params
                .iter()
                .map(|p| format!("{}: {}", p.name, p.ty))
                .collect();
            let ret = ret.as_ref().map_or_else(|| "Unit".to_string(), TypeRef::to_string);
            (
                DeclarationKind::Function,
                format!("({}) -> {ret}", params.join(", ")),
                defaults,
                None,
            )
        }
        ItemKind::Constant { ty, .. } => (
            DeclarationKind::Constant,
            ty.to_string(),
            Vec::new(),
            constants.get(&item.name).map(Value::to_string),
        ),
        ItemKind::Type { definition } => (
            DeclarationKind::Type,
            definition.to_string(),
            Vec::new(),
            None,
        ),
    };
    DeclarationShape {
        kind,
        name: item.name.clone(),
        visibility: item.visibility,
        signature,
        annotations: item.annotations.clone(),
        parameter_defaults,
        constant_value,
    }
}

fn visibility_prefix(visibility: Visibility) -> &'static str {
    match visibility {
        Visibility::Public => "pub ",
        Visibility::Internal => "internal ",
        Visibility::Private => "",
    }
}

fn render_tokens(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|t| t.kind.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lowers a unit to its canonical text form.
fn lower(
    unit: &SourceUnit,
    file: &SourceFile,
    constants: &HashMap<String, Value>,
    ctx: &ModuleContext,
) -> String {
    let debug = ctx.options.get(DEBUG_OPTION).is_some_and(|v| v == "true");
    let mut out = String::new();
    let _ = writeln!(out, "unit {}", unit.id);
    for item in &file.items {
        for annotation in &item.annotations {
            let _ = write!(out, "@{annotation} ");
        }
        let _ = write!(
            out,
            "{}{} {}::{}",
            visibility_prefix(item.visibility),
            item.kind.keyword(),
            ctx.module,
            item.name
        );
        match &item.kind {
            ItemKind::Function { params, ret, body } => {
                let params: Vec<String> = params
                    .iter()
                    .map(|p| match &p.default {
                        Some(default) => format!("{}: {} = {}", p.name, p.ty, render_tokens(default)),
                        None => format!("{}: {}", p.name, p.ty),
                    })
                    .collect();
                let ret = ret.as_ref().map_or_else(|| "Unit".to_string(), TypeRef::to_string);
                let _ = write!(
                    out,
                    "({}) -> {ret} {{ {} }}",
                    params.join(", "),
                    render_tokens(body)
                );
            }
            ItemKind::Constant { ty, .. } => {
                let value = constants
                    .get(&item.name)
                    .map(Value::to_string)
                    .unwrap_or_default();
                let _ = write!(out, ": {ty} = {value}");
            }
            ItemKind::Type { definition } => {
                let _ = write!(out, " = {definition}");
            }
        }
        if debug {
            let _ = write!(out, " # line {}", item.line);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_cache::{ExportTable, ExportedDeclaration};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn compile(source: &str, ctx: &ModuleContext) -> Result<CompiledUnit, CompileError> {
        KilnCompiler.compile_unit(&SourceUnit::new("app/main.kl", "main.kl"), source.as_bytes(), ctx)
    }

    fn lib_table(entries: &[(&str, Visibility)]) -> Arc<ExportTable> {
        Arc::new(
            entries
                .iter()
                .map(|(name, visibility)| {
                    (
                        name.to_string(),
                        ExportedDeclaration {
                            fingerprint: kiln_common::Fingerprint::from_raw(1),
                            visibility: *visibility,
                        },
                    )
                })
                .collect(),
        )
    }

    fn app_ctx(friend: bool) -> ModuleContext {
        let mut ctx = ModuleContext {
            module: "app".into(),
            dependencies: BTreeMap::from([(
                "lib".to_string(),
                lib_table(&[("g", Visibility::Public), ("secret", Visibility::Internal)]),
            )]),
            ..ModuleContext::default()
        };
        if friend {
            ctx.friends.insert("lib".into());
        }
        ctx
    }

    fn fingerprint_of(unit: &CompiledUnit, name: &str) -> kiln_common::Fingerprint {
        unit.declarations
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.fingerprint)
            .unwrap()
    }

    #[test]
    fn references_are_collected() {
        let unit = compile(
            "pub fn main(n: Int) -> Int { let k = lib::g(n) k + helper() + LIMIT }\nfn helper() -> Int { 1 }",
            &app_ctx(false),
        )
        .unwrap();
        assert_eq!(
            unit.references,
            vec![Reference::new("app", "LIMIT"), Reference::new("lib", "g")]
        );
        assert_eq!(unit.declarations.len(), 2);
        assert_eq!(unit.declarations[1].visibility, Visibility::Private);
    }

    #[test]
    fn body_edits_keep_fingerprints() {
        let ctx = app_ctx(false);
        let a = compile("pub fn f(x: Int) -> Int { x + 1 }", &ctx).unwrap();
        let b = compile("pub fn f(x: Int) -> Int {\n  x + 2\n}", &ctx).unwrap();
        assert_eq!(fingerprint_of(&a, "f"), fingerprint_of(&b, "f"));
        assert_ne!(a.artifact, b.artifact);
    }

    #[test]
    fn signature_parts_change_fingerprints() {
        let ctx = app_ctx(false);
        let base = fingerprint_of(&compile("pub fn f(x: Int) -> Int { x }", &ctx).unwrap(), "f");
        for variant in [
            "pub fn f(x: Long) -> Int { x }",
            "pub fn f(x: Int = 3) -> Int { x }",
            "@inline\npub fn f(x: Int) -> Int { x }",
            "internal fn f(x: Int) -> Int { x }",
            "pub fn f(x: Int) -> Long { x }",
        ] {
            assert_ne!(base, fingerprint_of(&compile(variant, &ctx).unwrap(), "f"), "{variant}");
        }
    }

    #[test]
    fn constant_values_participate() {
        let ctx = app_ctx(false);
        let ten = compile("pub const LIMIT: Int = 10", &ctx).unwrap();
        let also_ten = compile("pub const LIMIT: Int = 5 + 5", &ctx).unwrap();
        let eleven = compile("pub const LIMIT: Int = 11", &ctx).unwrap();
        assert_eq!(fingerprint_of(&ten, "LIMIT"), fingerprint_of(&also_ten, "LIMIT"));
        assert_ne!(fingerprint_of(&ten, "LIMIT"), fingerprint_of(&eleven, "LIMIT"));
    }

    #[test]
    fn visibility_rules() {
        let err = compile("fn f() { other::x() }", &app_ctx(false)).unwrap_err();
        assert!(err.message.contains("not a dependency"));
        assert_eq!(err.line, Some(1));

        let err = compile("fn f() { lib::missing() }", &app_ctx(false)).unwrap_err();
        assert!(err.message.contains("unresolved reference 'lib::missing'"));

        let err = compile("\nfn f() { lib::secret() }", &app_ctx(false)).unwrap_err();
        assert!(err.message.contains("is internal to 'lib'"));
        assert_eq!(err.line, Some(2));

        assert!(compile("fn f() { lib::secret() }", &app_ctx(true)).is_ok());
    }

    #[test]
    fn unit_level_errors() {
        let err = compile("fn f() { 1 }\nfn f() { 2 }", &app_ctx(false)).unwrap_err();
        assert!(err.message.contains("duplicate declaration 'f'"));
        assert_eq!(err.line, Some(2));

        let err = compile("const X: Int = \"text\"", &app_ctx(false)).unwrap_err();
        assert!(err.message.contains("declared as Int"));

        assert!(KilnCompiler
            .compile_unit(&SourceUnit::new("a.kl", "a.kl"), &[0xff, 0xfe], &app_ctx(false))
            .is_err());
    }

    #[test]
    fn lowering_is_canonical() {
        let mut ctx = app_ctx(false);
        let unit = compile(
            "@pure\npub fn g(x: Int, y: Int = 1) -> Int { x + y }\nconst N: Int = 2 * 3\ntype Id = lib::g",
            &ctx,
        )
        .unwrap();
        let text = String::from_utf8(unit.artifact).unwrap();
        assert_eq!(
            text,
            "unit app/main.kl\n\
             @pure pub fn app::g(x: Int, y: Int = 1) -> Int { x + y }\n\
             const app::N: Int = 6\n\
             type app::Id = lib::g\n"
        );

        ctx.options.insert(DEBUG_OPTION.into(), "true".into());
        let unit = compile("fn f() { 1 }", &ctx).unwrap();
        assert!(String::from_utf8(unit.artifact).unwrap().contains("# line 1"));
    }
}
