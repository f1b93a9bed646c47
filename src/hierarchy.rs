use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::warn;

use crate::ir::ROOT_CLASS;

/// Supertype facts for one class, by internal name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct TypeInfo {
    pub(crate) super_name: Option<String>,
    pub(crate) interfaces: Vec<String>,
    pub(crate) is_interface: bool,
}

/// Answers the type questions stack map computation asks.
pub(crate) trait TypeHierarchy {
    fn lookup(&self, class_name: &str) -> Option<&TypeInfo>;

    /// Nearest common superclass of two classes. Unknown types resolve to the
    /// root type, which the verifier always accepts.
    fn common_super_class(&self, first: &str, second: &str) -> String {
        if first == second {
            return first.to_string();
        }
        let (Some(first_info), Some(second_info)) = (self.lookup(first), self.lookup(second))
        else {
            self.report_fallback(first, second);
            return ROOT_CLASS.to_string();
        };
        if self.is_assignable(first, second) {
            return first.to_string();
        }
        if self.is_assignable(second, first) {
            return second.to_string();
        }
        if first_info.is_interface || second_info.is_interface {
            return ROOT_CLASS.to_string();
        }
        let mut current = first_info.super_name.clone();
        while let Some(candidate) = current {
            if self.is_assignable(&candidate, second) {
                return candidate;
            }
            current = match self.lookup(&candidate) {
                Some(info) => info.super_name.clone(),
                None => {
                    self.report_fallback(&candidate, second);
                    return ROOT_CLASS.to_string();
                }
            };
        }
        ROOT_CLASS.to_string()
    }

    /// Whether a value of class `from` can be stored in a variable of class `to`.
    fn is_assignable(&self, to: &str, from: &str) -> bool {
        if to == from || to == ROOT_CLASS {
            return true;
        }
        let mut pending = vec![from.to_string()];
        let mut seen = Vec::new();
        while let Some(current) = pending.pop() {
            if current == to {
                return true;
            }
            if seen.contains(&current) {
                continue;
            }
            let Some(info) = self.lookup(&current) else {
                seen.push(current);
                continue;
            };
            if let Some(super_name) = &info.super_name {
                pending.push(super_name.clone());
            }
            pending.extend(info.interfaces.iter().cloned());
            seen.push(current);
        }
        false
    }

    /// Called when a lookup fails and the root type is substituted.
    fn report_fallback(&self, first: &str, second: &str) {
        warn!(
            first,
            second, "type not resolvable for stack map merge; using {ROOT_CLASS}"
        );
    }
}

/// Symbol table built from the class set being rewritten.
#[derive(Debug, Default)]
pub(crate) struct SymbolTable {
    types: BTreeMap<String, TypeInfo>,
    fallbacks: Mutex<Vec<(String, String)>>,
}

impl SymbolTable {
    pub(crate) fn new() -> Self {
        let mut table = Self::default();
        table.insert(
            ROOT_CLASS,
            TypeInfo {
                super_name: None,
                interfaces: Vec::new(),
                is_interface: false,
            },
        );
        for name in ["java/lang/Throwable", "java/lang/Exception"] {
            let super_name = if name == "java/lang/Throwable" {
                ROOT_CLASS
            } else {
                "java/lang/Throwable"
            };
            table.insert(
                name,
                TypeInfo {
                    super_name: Some(super_name.to_string()),
                    interfaces: vec!["java/io/Serializable".to_string()],
                    is_interface: false,
                },
            );
        }
        for (name, super_name) in [
            ("java/lang/Error", "java/lang/Throwable"),
            ("java/lang/AssertionError", "java/lang/Error"),
            ("java/lang/RuntimeException", "java/lang/Exception"),
        ] {
            table.insert(
                name,
                TypeInfo {
                    super_name: Some(super_name.to_string()),
                    interfaces: Vec::new(),
                    is_interface: false,
                },
            );
        }
        table.insert(
            "java/io/Serializable",
            TypeInfo {
                super_name: Some(ROOT_CLASS.to_string()),
                interfaces: Vec::new(),
                is_interface: true,
            },
        );
        table
    }

    pub(crate) fn insert(&mut self, class_name: &str, info: TypeInfo) {
        self.types.insert(class_name.to_string(), info);
    }

    pub(crate) fn super_name(&self, class_name: &str) -> Option<&str> {
        self.types
            .get(class_name)
            .and_then(|info| info.super_name.as_deref())
    }

    /// Type pairs that fell back to the root type so far.
    pub(crate) fn fallbacks(&self) -> Vec<(String, String)> {
        match self.fallbacks.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TypeHierarchy for SymbolTable {
    fn lookup(&self, class_name: &str) -> Option<&TypeInfo> {
        self.types.get(class_name)
    }

    fn report_fallback(&self, first: &str, second: &str) {
        warn!(
            first,
            second, "type not resolvable for stack map merge; using {ROOT_CLASS}"
        );
        let mut guard = match self.fallbacks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push((first.to_string(), second.to_string()));
    }
}
