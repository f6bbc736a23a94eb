//! Invalidation rules and key patterns.
//!
//! A mutation kind declares one or more [`InvalidationRule`]s. Each rule
//! carries a [`KeyPattern`] whose parameter values are either literals or
//! taken from the mutation context. Resolving a pattern against a context
//! yields a [`KeyPredicate`], which the cache store evaluates against its keys.

use std::fmt;
use std::sync::Arc;

use crate::{CacheKey, KeyError, OperationName, ParamValue, Params};

/// Context supplied by a mutation call site, e.g. `{entity: "E1"}`.
///
/// Built with the same canonicalizing builder as read parameters so the
/// values line up with the keys they invalidate.
pub type MutationContext = Params;

/// Where a pattern parameter gets its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamSource {
    Literal(ParamValue),
    /// Copy the named field from the mutation context.
    Context(String),
}

/// Custom predicate over a key and the mutation context.
pub type ContextPredicate = Arc<dyn Fn(&CacheKey, &MutationContext) -> bool + Send + Sync>;

/// Declared shape of the keys a mutation affects.
#[derive(Clone)]
pub enum KeyPattern {
    /// Exactly one key.
    Exact {
        operation: String,
        params: Vec<(String, ParamSource)>,
    },
    /// All keys of an operation whose parameters include the given fields.
    Prefix {
        operation: String,
        params: Vec<(String, ParamSource)>,
    },
    /// Every key of an operation.
    Operation(String),
    /// Arbitrary predicate, optionally scoped to one operation.
    Predicate {
        operation: Option<String>,
        label: String,
        predicate: ContextPredicate,
        /// Fields bound onto the predicate. A predicate has no parameter
        /// template, so any entry here fails [`KeyPattern::validate`].
        bound: Vec<String>,
    },
}

impl KeyPattern {
    pub fn exact(operation: impl Into<String>) -> Self {
        Self::Exact {
            operation: operation.into(),
            params: Vec::new(),
        }
    }

    pub fn prefix(operation: impl Into<String>) -> Self {
        Self::Prefix {
            operation: operation.into(),
            params: Vec::new(),
        }
    }

    pub fn operation(operation: impl Into<String>) -> Self {
        Self::Operation(operation.into())
    }

    pub fn predicate<F>(operation: Option<&str>, label: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&CacheKey, &MutationContext) -> bool + Send + Sync + 'static,
    {
        Self::Predicate {
            operation: operation.map(str::to_string),
            label: label.into(),
            predicate: Arc::new(predicate),
            bound: Vec::new(),
        }
    }

    /// Take key field `name` from the context field of the same name.
    pub fn bind(self, name: impl Into<String>) -> Self {
        let name = name.into();
        let source = ParamSource::Context(name.clone());
        self.with_param(name, source)
    }

    /// Take key field `name` from context field `context_field`.
    pub fn bind_as(self, name: impl Into<String>, context_field: impl Into<String>) -> Self {
        self.with_param(name.into(), ParamSource::Context(context_field.into()))
    }

    /// Fix key field `name` to a literal value.
    pub fn literal(self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.with_param(name.into(), ParamSource::Literal(value.into()))
    }

    /// Binding onto an operation-wide pattern narrows it to a prefix.
    fn with_param(self, name: String, source: ParamSource) -> Self {
        match self {
            Self::Exact {
                operation,
                mut params,
            } => {
                params.push((name, source));
                Self::Exact { operation, params }
            }
            Self::Prefix {
                operation,
                mut params,
            } => {
                params.push((name, source));
                Self::Prefix { operation, params }
            }
            Self::Operation(operation) => Self::Prefix {
                operation,
                params: vec![(name, source)],
            },
            Self::Predicate {
                operation,
                label,
                predicate,
                mut bound,
            } => {
                bound.push(name);
                Self::Predicate {
                    operation,
                    label,
                    predicate,
                    bound,
                }
            }
        }
    }

    /// Operation this pattern is scoped to, if any.
    pub fn operation_name(&self) -> Option<&str> {
        match self {
            Self::Exact { operation, .. }
            | Self::Prefix { operation, .. }
            | Self::Operation(operation) => Some(operation),
            Self::Predicate { operation, .. } => operation.as_deref(),
        }
    }

    /// Check the pattern is well formed without a context.
    pub fn validate(&self) -> Result<(), KeyError> {
        if let Some(operation) = self.operation_name() {
            OperationName::new(operation)?;
        }
        match self {
            Self::Exact { params, .. } | Self::Prefix { params, .. } => {
                if params.iter().any(|(name, _)| name.is_empty()) {
                    return Err(KeyError::EmptyParamName);
                }
            }
            Self::Predicate { label, bound, .. } => {
                if let Some(name) = bound.first() {
                    return Err(KeyError::UnusedBinding {
                        name: name.clone(),
                        pattern: label.clone(),
                    });
                }
            }
            Self::Operation(_) => {}
        }
        Ok(())
    }

    /// Substitute context values and produce a predicate over keys.
    pub fn resolve(&self, context: &MutationContext) -> Result<KeyPredicate, KeyError> {
        match self {
            Self::Exact { operation, params } => Ok(KeyPredicate::Exact(CacheKey::from_parts(
                OperationName::new(operation.as_str())?,
                resolve_params(params, context)?,
            ))),
            Self::Prefix { operation, params } => Ok(KeyPredicate::Prefix {
                operation: OperationName::new(operation.as_str())?,
                params: resolve_params(params, context)?,
            }),
            Self::Operation(operation) => {
                Ok(KeyPredicate::Operation(OperationName::new(operation.as_str())?))
            }
            Self::Predicate {
                operation,
                label,
                predicate,
                ..
            } => {
                let operation = operation
                    .as_deref()
                    .map(OperationName::new)
                    .transpose()?;
                let predicate = Arc::clone(predicate);
                let context = context.clone();
                Ok(KeyPredicate::Custom {
                    operation,
                    label: label.clone(),
                    predicate: Arc::new(move |key: &CacheKey| predicate(key, &context)),
                })
            }
        }
    }
}

impl fmt::Debug for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact { operation, params } => f
                .debug_struct("Exact")
                .field("operation", operation)
                .field("params", params)
                .finish(),
            Self::Prefix { operation, params } => f
                .debug_struct("Prefix")
                .field("operation", operation)
                .field("params", params)
                .finish(),
            Self::Operation(operation) => f.debug_tuple("Operation").field(operation).finish(),
            Self::Predicate { operation, label, .. } => f
                .debug_struct("Predicate")
                .field("operation", operation)
                .field("label", label)
                .finish_non_exhaustive(),
        }
    }
}

fn resolve_params(
    template: &[(String, ParamSource)],
    context: &MutationContext,
) -> Result<Params, KeyError> {
    let mut builder = Params::builder();
    for (name, source) in template {
        let value = match source {
            ParamSource::Literal(value) => value.clone(),
            ParamSource::Context(field) => context
                .get(field)
                .cloned()
                .ok_or_else(|| KeyError::MissingContextField {
                    field: field.clone(),
                })?,
        };
        builder = builder.param(name.clone(), value);
    }
    builder.build()
}

/// A resolved predicate over cache keys.
#[derive(Clone)]
pub enum KeyPredicate {
    Exact(CacheKey),
    Prefix {
        operation: OperationName,
        params: Params,
    },
    Operation(OperationName),
    Custom {
        operation: Option<OperationName>,
        label: String,
        predicate: Arc<dyn Fn(&CacheKey) -> bool + Send + Sync>,
    },
    All,
}

impl KeyPredicate {
    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Prefix { operation, params } => {
                key.operation() == operation && key.params().contains_all(params)
            }
            Self::Operation(operation) => key.operation() == operation,
            Self::Custom {
                operation,
                predicate,
                ..
            } => operation.as_ref().map_or(true, |op| key.operation() == op) && predicate(key),
            Self::All => true,
        }
    }

    /// Operation every matching key belongs to, if the predicate is scoped.
    pub fn operation(&self) -> Option<&OperationName> {
        match self {
            Self::Exact(key) => Some(key.operation()),
            Self::Prefix { operation, .. } | Self::Operation(operation) => Some(operation),
            Self::Custom { operation, .. } => operation.as_ref(),
            Self::All => None,
        }
    }
}

impl fmt::Debug for KeyPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(key) => f.debug_tuple("Exact").field(key).finish(),
            Self::Prefix { operation, params } => f
                .debug_struct("Prefix")
                .field("operation", operation)
                .field("params", params)
                .finish(),
            Self::Operation(operation) => f.debug_tuple("Operation").field(operation).finish(),
            Self::Custom { operation, label, .. } => f
                .debug_struct("Custom")
                .field("operation", operation)
                .field("label", label)
                .finish_non_exhaustive(),
            Self::All => f.write_str("All"),
        }
    }
}

impl fmt::Display for KeyPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(key) => write!(f, "{}", key),
            Self::Prefix { operation, params } => write!(f, "{}{}*", operation, params),
            Self::Operation(operation) => write!(f, "{}*", operation),
            Self::Custom {
                operation: Some(operation),
                label,
                ..
            } => write!(f, "{}[{}]", operation, label),
            Self::Custom { label, .. } => write!(f, "*[{}]", label),
            Self::All => f.write_str("*"),
        }
    }
}

/// Declared effect of a mutation kind on cached reads.
#[derive(Debug, Clone)]
pub struct InvalidationRule {
    pub mutation_kind: String,
    pub pattern: KeyPattern,
}

impl InvalidationRule {
    pub fn new(mutation_kind: impl Into<String>, pattern: KeyPattern) -> Self {
        Self {
            mutation_kind: mutation_kind.into(),
            pattern,
        }
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn entity_strategy() -> impl Strategy<Value = String> {
        "E[0-9]{1,3}"
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(300))]

        /// Property: an exact pattern matches exactly the key built from the same context.
        #[test]
        fn prop_exact_matches_only_its_key(a in entity_strategy(), b in entity_strategy()) {
            let ctx = Params::builder().param("entity", a.as_str()).build().expect("ctx");
            let predicate = KeyPattern::exact("list-vouchers")
                .bind("entity")
                .resolve(&ctx)
                .expect("resolve");

            let key_b = CacheKey::new(
                "list-vouchers",
                Params::builder().param("entity", b.as_str()).build().expect("params"),
            )
            .expect("key");

            prop_assert_eq!(predicate.matches(&key_b), a == b);
        }

        /// Property: anything an exact predicate matches, the prefix predicate matches too.
        #[test]
        fn prop_prefix_covers_exact(entity in entity_strategy(), page in 0i64..50) {
            let ctx = Params::builder().param("entity", entity.as_str()).build().expect("ctx");
            let prefix = KeyPattern::prefix("list-vouchers").bind("entity").resolve(&ctx).expect("resolve");

            let key = CacheKey::new(
                "list-vouchers",
                Params::builder()
                    .param("entity", entity.as_str())
                    .param("page", page)
                    .build()
                    .expect("params"),
            )
            .expect("key");

            prop_assert!(prefix.matches(&key));
        }
    }
}
