//! Link condition evaluation (v0.1)
//!
//! Link expressions address flow attributes with a `$name[.path]` syntax.
//! At definition load the expressions are rewritten for the embedded script
//! engine (`$var` becomes `v["var"]`, `isDefined($var)` becomes a boolean
//! binding `isdN`) and compiled once; evaluation binds the referenced
//! attributes and runs the cached AST. Any fault yields `false` with a
//! warning, never an execution error.

use std::collections::HashMap;
use std::fmt;

use rhai::{Dynamic, Engine, Scope as RhaiScope, AST};
use serde_json::Value;
use tracing::{debug, warn};

use crate::definition::{Link, LinkId, LinkType};
use crate::path::{get_map_value, parse_attr_ref};
use crate::scope::Scope;
use crate::value::fix_up_value;

/// A variable referenced by a link expression. `isd > 0` marks an
/// `isDefined` binding (presence, not value).
#[derive(Debug, Clone, PartialEq)]
pub struct VarInfo {
    pub name: String,
    pub isd: usize,
}

struct CompiledExpr {
    ast: AST,
    vars: Vec<VarInfo>,
}

/// Holds the compiled conditions of a definition's expression links
pub struct LinkExprManager {
    engine: Engine,
    exprs: HashMap<LinkId, CompiledExpr>,
}

impl fmt::Debug for LinkExprManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkExprManager")
            .field("compiled", &self.exprs.len())
            .finish()
    }
}

impl LinkExprManager {
    /// Compile the conditions of every expression link. Links that fail to
    /// compile are logged and evaluate to `false`.
    pub fn new<'a>(links: impl IntoIterator<Item = &'a Link>) -> Self {
        let mut engine = Engine::new();
        engine.set_max_expr_depths(64, 64);

        let mut exprs = HashMap::new();

        for link in links {
            if link.link_type != LinkType::Expression || link.value.trim().is_empty() {
                continue;
            }

            let (vars, rewritten) = rewrite_expr(&link.value);
            debug!(link = link.id, expr = %rewritten, "compiled link expression");

            match engine.compile_expression(&rewritten) {
                Ok(ast) => {
                    exprs.insert(link.id, CompiledExpr { ast, vars });
                }
                Err(e) => {
                    warn!(link = link.id, expr = %link.value, error = %e,
                        "error preparing link expression");
                }
            }
        }

        Self { engine, exprs }
    }

    /// Evaluate a link's condition against the given scope.
    ///
    /// Dependency links are always true. Missing attributes, unresolvable
    /// paths, and evaluator faults all yield `false` with a warning.
    pub fn eval_link_expr(&self, link: &Link, scope: &dyn Scope) -> bool {
        if link.link_type == LinkType::Dependency {
            return true;
        }

        let Some(compiled) = self.exprs.get(&link.id) else {
            warn!(link = link.id, expr = %link.value,
                "link expression did not compile, evaluating to false");
            return false;
        };

        let mut rhai_scope = RhaiScope::new();
        let mut vals = rhai::Map::new();

        for var in &compiled.vars {
            let reference = parse_attr_ref(&var.name);
            let attr = scope.get_attr(&reference.root);

            if var.isd > 0 {
                let exists = match &attr {
                    Some(a) if !reference.sub.is_empty() => {
                        get_map_value(&a.value, &reference.sub).is_ok()
                    }
                    Some(_) => true,
                    None => false,
                };
                rhai_scope.push(format!("isd{}", var.isd), exists);
                continue;
            }

            let Some(attr) = attr else {
                warn!(link = link.id, attr = %reference.root,
                    "attribute not defined, link evaluates to false");
                return false;
            };

            let mut attr_value = attr.value;
            if !reference.sub.is_empty() {
                attr_value = match get_map_value(&attr_value, &reference.sub) {
                    Ok(v) => fix_up_value(v),
                    Err(e) => {
                        warn!(link = link.id, error = %e,
                            "path not resolvable, link evaluates to false");
                        return false;
                    }
                };
            }

            vals.insert(var.name.as_str().into(), json_to_dynamic(&attr_value));
        }

        rhai_scope.push("v", vals);

        match self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut rhai_scope, &compiled.ast)
        {
            Ok(result) => result.as_bool().unwrap_or_else(|_| {
                warn!(link = link.id, expr = %link.value,
                    "link expression did not evaluate to a boolean");
                false
            }),
            Err(e) => {
                warn!(link = link.id, expr = %link.value, error = %e,
                    "error evaluating link expression");
                false
            }
        }
    }
}

/// Rewrite `$var` references for the script engine, collecting the
/// referenced variables in order.
pub fn rewrite_expr(expr: &str) -> (Vec<VarInfo>, String) {
    const ISDEF: &str = "isDefined(";

    let chars: Vec<char> = expr.chars().collect();
    let mut out = String::with_capacity(expr.len());
    let mut vars = Vec::new();
    let mut isd = 0;

    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '$' {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        let is_def_check = out.ends_with(ISDEF);
        let mut ignore_braces = chars.get(i + 1) == Some(&'{');

        let mut j = i + 1;
        while j < chars.len() {
            let (part, ib) = is_part_of_name(chars[j], ignore_braces);
            ignore_braces = ib;
            if !part {
                break;
            }
            j += 1;
        }

        let name: String = chars[i + 1..j].iter().collect();

        if is_def_check {
            isd += 1;
            vars.push(VarInfo {
                name,
                isd,
            });
            out.truncate(out.len() - ISDEF.len());
            out.push_str(&format!("isd{isd}"));
            i = j + 1; // consume the closing paren
        } else {
            out.push_str(&format!("v[\"{name}\"]"));
            vars.push(VarInfo { name, isd: 0 });
            i = j;
        }
    }

    (vars, out)
}

fn is_part_of_name(c: char, ignore_braces: bool) -> (bool, bool) {
    if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
        (true, ignore_braces)
    } else if ignore_braces && c == '{' {
        (true, true)
    } else if ignore_braces && c == '}' {
        (true, false)
    } else {
        (false, ignore_braces)
    }
}

fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into()
            } else if let Some(f) = n.as_f64() {
                f.into()
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => s.clone().into(),
        Value::Array(arr) => arr
            .iter()
            .map(json_to_dynamic)
            .collect::<rhai::Array>()
            .into(),
        Value::Object(obj) => obj
            .iter()
            .map(|(k, v)| (k.as_str().into(), json_to_dynamic(v)))
            .collect::<rhai::Map>()
            .into(),
    }
}
