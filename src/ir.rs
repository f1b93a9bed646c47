use serde::{Deserialize, Serialize};

use crate::descriptor::normalize_descriptor;

/// Internal name of the universal root type.
pub(crate) const ROOT_CLASS: &str = "java/lang/Object";

/// Convert a dotted class name (`a.b.C`) to its internal form (`a/b/C`).
pub(crate) fn internal_name(class_name: &str) -> String {
    class_name.replace('.', "/")
}

/// Convert an internal class name (`a/b/C`) to its dotted form (`a.b.C`).
pub(crate) fn dotted_name(class_name: &str) -> String {
    class_name.replace('/', ".")
}

/// Test framework generation, selecting which marker annotations apply.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Framework {
    #[default]
    Junit4,
    Junit5,
}

impl Framework {
    /// Annotation descriptor that tells the runner to skip a class or method.
    pub(crate) fn disable_descriptor(self) -> &'static str {
        match self {
            Framework::Junit4 => "Lorg/junit/Ignore;",
            Framework::Junit5 => "Lorg/junit/jupiter/api/Disabled;",
        }
    }

    /// Annotation descriptor that marks a method as a test.
    pub(crate) fn test_descriptor(self) -> &'static str {
        match self {
            Framework::Junit4 => "Lorg/junit/Test;",
            Framework::Junit5 => "Lorg/junit/jupiter/api/Test;",
        }
    }

    pub(crate) const ALL: [Framework; 2] = [Framework::Junit4, Framework::Junit5];
}

/// A method identified by declaring class, name and descriptor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct MethodRef {
    /// Dotted fully qualified name of the declaring class.
    #[serde(rename = "class")]
    pub(crate) declaring_class: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl MethodRef {
    pub(crate) fn new(declaring_class: &str, name: &str, descriptor: &str) -> Self {
        Self {
            declaring_class: declaring_class.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }

    /// Parameter list compared when matching, falling back to the raw text when it does not parse.
    pub(crate) fn normalized_descriptor(&self) -> String {
        normalize_descriptor(&self.descriptor).unwrap_or_else(|_| self.descriptor.clone())
    }

    /// Whether a declared method with this name and descriptor is this method.
    pub(crate) fn matches(&self, name: &str, descriptor: &str) -> bool {
        if self.name != name {
            return false;
        }
        match normalize_descriptor(descriptor) {
            Ok(normalized) => normalized == self.normalized_descriptor(),
            Err(_) => descriptor == self.descriptor,
        }
    }

    pub(crate) fn is_initializer(&self) -> bool {
        is_initializer_name(&self.name)
    }

    fn identity(&self) -> (&str, &str, String) {
        (
            self.declaring_class.as_str(),
            self.name.as_str(),
            self.normalized_descriptor(),
        )
    }
}

impl PartialEq for MethodRef {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for MethodRef {}

impl std::fmt::Display for MethodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}{}", self.declaring_class, self.name, self.descriptor)
    }
}

/// Constructors and static initializers, compared case-insensitively.
pub(crate) fn is_initializer_name(name: &str) -> bool {
    name.eq_ignore_ascii_case("<init>") || name.eq_ignore_ascii_case("<clinit>")
}

/// Coverage counters for one candidate method.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ScoredMethod {
    #[serde(flatten)]
    pub(crate) method: MethodRef,
    #[serde(default)]
    pub(crate) instructions_covered: u64,
    #[serde(default)]
    pub(crate) instructions_missed: u64,
    #[serde(default)]
    pub(crate) branches_covered: u64,
    #[serde(default)]
    pub(crate) branches_missed: u64,
}

/// Result of running one test.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Outcome {
    Passed,
    Failed,
    /// The class under test was rejected by the verifier.
    Unusable,
}

/// A test method as reported by the external runner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct TestCase {
    #[serde(flatten)]
    pub(crate) method: MethodRef,
    pub(crate) outcome: Outcome,
    #[serde(default)]
    pub(crate) execution_time: f64,
    /// Class that textually defines the test when it differs from the reported class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) superclass_owner: Option<String>,
    /// Class the runner reported the test under, kept once ownership moves the test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) reported_class: Option<String>,
    #[serde(default)]
    pub(crate) framework: Framework,
}

impl TestCase {
    /// Class used to select the test in the runner.
    pub(crate) fn launch_class(&self) -> &str {
        self.reported_class
            .as_deref()
            .unwrap_or(&self.method.declaring_class)
    }

    /// Class whose name the debugger sees for the test method.
    pub(crate) fn owner_class(&self) -> &str {
        self.superclass_owner
            .as_deref()
            .unwrap_or_else(|| self.launch_class())
    }

    /// Reassign the test to the class that defines it.
    pub(crate) fn move_to(&mut self, owner: &str) {
        if self.reported_class.is_none() {
            self.reported_class = Some(self.method.declaring_class.clone());
        }
        self.method.declaring_class = owner.to_string();
        self.superclass_owner = Some(owner.to_string());
    }

    /// Fully qualified test identifier, `Class.name`.
    pub(crate) fn display_name(&self) -> String {
        format!("{}.{}", self.launch_class(), self.method.name)
    }
}

impl PartialEq for TestCase {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method
    }
}

impl Eq for TestCase {}

/// A class the runner reported as a whole that must be disabled.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct ExcludedClass {
    #[serde(rename = "class")]
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) framework: Framework,
}

impl ExcludedClass {
    /// Outer class name, dropping any `$Inner` suffix.
    pub(crate) fn outer_name(&self) -> &str {
        match self.name.find('$') {
            Some(index) => &self.name[..index],
            None => &self.name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_case(class: &str, name: &str, descriptor: &str, outcome: Outcome) -> TestCase {
        TestCase {
            method: MethodRef::new(class, name, descriptor),
            outcome,
            execution_time: 0.0,
            superclass_owner: None,
            reported_class: None,
            framework: Framework::Junit5,
        }
    }

    #[test]
    fn test_equality_ignores_outcome_and_time() {
        let mut first = test_case("a.Child", "t", "()V", Outcome::Passed);
        first.execution_time = 1.5;
        let second = test_case("a.Child", "t", "()", Outcome::Failed);
        assert_eq!(first, second);
        assert_ne!(first, test_case("a.Base", "t", "()V", Outcome::Passed));
    }

    #[test]
    fn method_matching_uses_normalized_parameters() {
        let method = MethodRef::new("a.B", "run", "(Ljava/lang/String;I)");
        assert!(method.matches("run", "(Ljava/lang/String;I)V"));
        assert!(!method.matches("run", "(I)V"));
        assert!(!method.matches("walk", "(Ljava/lang/String;I)V"));
    }

    #[test]
    fn moving_a_test_keeps_launch_class() {
        let mut test = test_case("a.Child", "t", "()V", Outcome::Failed);
        test.move_to("a.Base");
        test.move_to("a.Root");
        assert_eq!(test.method.declaring_class, "a.Root");
        assert_eq!(test.launch_class(), "a.Child");
        assert_eq!(test.owner_class(), "a.Root");
        assert_eq!(test.display_name(), "a.Child.t");
    }

    #[test]
    fn excluded_class_matches_outer_name() {
        let class = ExcludedClass {
            name: "org.x.Outer$Inner".to_string(),
            framework: Framework::Junit4,
        };
        assert_eq!(class.outer_name(), "org.x.Outer");
    }

    #[test]
    fn initializers_are_case_insensitive() {
        assert!(is_initializer_name("<init>"));
        assert!(is_initializer_name("<CLINIT>"));
        assert!(!is_initializer_name("init"));
    }

    #[test]
    fn test_case_parses_from_report_json() {
        let json = r#"{"class":"a.B","name":"t","descriptor":"()V",
                      "outcome":"failed","framework":"junit5"}"#;
        let test: TestCase = serde_json::from_str(json).expect("parse test case");
        assert_eq!(test.outcome, Outcome::Failed);
        assert_eq!(test.framework, Framework::Junit5);
        assert!(test.superclass_owner.is_none());
    }
}
