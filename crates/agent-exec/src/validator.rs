//! Static validation of a code fragment before anything executes.
//!
//! The fragment is parsed into a syntax tree and every statement is walked,
//! including bodies nested inside functions, classes, loops, `with`, `try`
//! and `match` arms. Each `import` / `from ... import` found has its root
//! package checked against [`crate::policy::ALLOWED_IMPORT_ROOTS`].
//!
//! A regex over the source text would be defeatable with whitespace tricks;
//! walking the tree is exact with respect to the fragment's static text.
//! Names assembled at runtime cannot dodge the check either, because the
//! interpreter's `__import__` consults the same allowlist (see `vm.rs`).

use rustpython_parser::{ast, Parse};
use thiserror::Error;

use crate::policy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The fragment is not parseable Python.
    #[error("SyntaxError: {0}")]
    Syntax(String),

    /// A static import names a module outside the allowlist.
    #[error("Import not allowed: '{module}'. Use only the provided tool functions and allowlisted modules.")]
    ForbiddenImport { module: String },
}

/// Parse `code` and verify every import statement is allowlisted.
pub fn validate_imports(code: &str) -> Result<(), ValidationError> {
    let suite = ast::Suite::parse(code, "<code_action>")
        .map_err(|e| ValidationError::Syntax(e.to_string()))?;
    walk_statements(&suite)
}

fn walk_statements(statements: &[ast::Stmt]) -> Result<(), ValidationError> {
    for statement in statements {
        walk_statement(statement)?;
    }
    Ok(())
}

fn walk_statement(statement: &ast::Stmt) -> Result<(), ValidationError> {
    match statement {
        ast::Stmt::Import(ast::StmtImport { names, .. }) => {
            for alias in names {
                check_module(alias.name.as_str())?;
            }
        }
        // Relative imports (`from . import x`) carry no absolute module name;
        // they fail at runtime anyway because fragments have no package.
        ast::Stmt::ImportFrom(ast::StmtImportFrom { module, .. }) => {
            if let Some(module) = module {
                check_module(module.as_str())?;
            }
        }

        ast::Stmt::FunctionDef(ast::StmtFunctionDef { body, .. })
        | ast::Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef { body, .. })
        | ast::Stmt::ClassDef(ast::StmtClassDef { body, .. })
        | ast::Stmt::With(ast::StmtWith { body, .. })
        | ast::Stmt::AsyncWith(ast::StmtAsyncWith { body, .. }) => {
            walk_statements(body)?;
        }

        ast::Stmt::For(ast::StmtFor { body, orelse, .. })
        | ast::Stmt::AsyncFor(ast::StmtAsyncFor { body, orelse, .. })
        | ast::Stmt::While(ast::StmtWhile { body, orelse, .. })
        | ast::Stmt::If(ast::StmtIf { body, orelse, .. }) => {
            walk_statements(body)?;
            walk_statements(orelse)?;
        }

        ast::Stmt::Try(ast::StmtTry {
            body,
            handlers,
            orelse,
            finalbody,
            ..
        })
        | ast::Stmt::TryStar(ast::StmtTryStar {
            body,
            handlers,
            orelse,
            finalbody,
            ..
        }) => {
            walk_statements(body)?;
            for handler in handlers {
                let ast::ExceptHandler::ExceptHandler(ast::ExceptHandlerExceptHandler {
                    body, ..
                }) = handler;
                walk_statements(body)?;
            }
            walk_statements(orelse)?;
            walk_statements(finalbody)?;
        }

        ast::Stmt::Match(ast::StmtMatch { cases, .. }) => {
            for case in cases {
                walk_statements(&case.body)?;
            }
        }

        _ => {}
    }
    Ok(())
}

fn check_module(module_name: &str) -> Result<(), ValidationError> {
    if policy::import_allowed(module_name) {
        Ok(())
    } else {
        Err(ValidationError::ForbiddenImport {
            module: module_name.to_string(),
        })
    }
}
