//! Declared-signature introspection.
//!
//! Rust closures carry no runtime parameter metadata, so a callable declares
//! its parameters explicitly. [`describe`] turns that declaration into an
//! ordered mapping keyed by parameter name, in declaration order. A callable
//! that declares nothing is not introspectable.

use indexmap::IndexMap;

use crate::instrument::Callable;
use crate::value::ArgValue;

/// Errors raised while determining a callable's signature.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntrospectionError {
    #[error("signature of `{0}` cannot be determined")]
    NotIntrospectable(String),
    #[error("duplicate parameter `{0}`")]
    DuplicateParameter(String),
    #[error("more than one {0} parameter declared")]
    DuplicateVariadic(ParameterKind),
}

/// Parameter kind taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Positional,
    Keyword,
    VarPositional,
    VarKeyword,
}

impl ParameterKind {
    pub fn is_variadic(&self) -> bool {
        matches!(self, ParameterKind::VarPositional | ParameterKind::VarKeyword)
    }
}

impl core::fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ParameterKind::Positional => write!(f, "positional"),
            ParameterKind::Keyword => write!(f, "keyword"),
            ParameterKind::VarPositional => write!(f, "variadic-positional"),
            ParameterKind::VarKeyword => write!(f, "variadic-keyword"),
        }
    }
}

/// Metadata for one declared parameter.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ParameterDescriptor {
    // The mapping key already carries the name.
    #[serde(skip_serializing)]
    pub name: String,
    pub kind: ParameterKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<ArgValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
}

impl ParameterDescriptor {
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            annotation: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<ArgValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }
}

/// Ordered mapping from parameter name to descriptor (declaration order).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(transparent)]
pub struct Signature {
    params: IndexMap<String, ParameterDescriptor>,
}

impl Signature {
    /// The empty signature (used when introspection fails).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate a parameter declaration.
    ///
    /// Names must be unique and at most one parameter of each variadic kind
    /// may appear.
    pub fn from_params<I>(params: I) -> Result<Self, IntrospectionError>
    where
        I: IntoIterator<Item = ParameterDescriptor>,
    {
        let mut out: IndexMap<String, ParameterDescriptor> = IndexMap::new();
        for param in params {
            if param.kind.is_variadic() && out.values().any(|p| p.kind == param.kind) {
                return Err(IntrospectionError::DuplicateVariadic(param.kind));
            }
            if out.contains_key(&param.name) {
                return Err(IntrospectionError::DuplicateParameter(param.name));
            }
            out.insert(param.name.clone(), param);
        }
        Ok(Self { params: out })
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDescriptor> {
        self.params.get(name)
    }

    /// Parameter names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParameterDescriptor> {
        self.params.values()
    }

    /// JSON object form attached to a run as configuration.
    pub fn to_config(&self) -> serde_json::Value {
        // Serializing plain data into a `Value` cannot fail.
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
    }
}

/// Describe a callable's declared parameters without invoking it.
pub fn describe<C: Callable + ?Sized>(callable: &C) -> Result<Signature, IntrospectionError> {
    callable.signature()
}

/// Describe a callable, degrading to the empty signature on failure.
pub fn describe_or_empty<C: Callable + ?Sized>(callable: &C) -> Signature {
    match describe(callable) {
        Ok(signature) => signature,
        Err(err) => {
            tracing::warn!(
                callable = callable.identifier(),
                error = %err,
                "signature introspection failed; using empty signature"
            );
            Signature::empty()
        }
    }
}
