//! Bucket key resolution.

/// Key shared by every call when no resolver is configured.
pub const STATIC_KEY: &str = "throttle:static";

/// Derives a bucket key from a call.
///
/// A resolver receives the name the call was wrapped under and a reference
/// to its arguments. Returning `None` exempts the call from that limit.
/// Resolvers run on every call and should be cheap.
pub trait KeyResolver<A>: Send + Sync {
    fn resolve(&self, name: &str, args: &A) -> Option<String>;
}

impl<A, F> KeyResolver<A> for F
where
    F: Fn(&str, &A) -> Option<String> + Send + Sync,
{
    fn resolve(&self, name: &str, args: &A) -> Option<String> {
        self(name, args)
    }
}

/// Resolves every call to one fixed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticKey(String);

impl StaticKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn key(&self) -> &str {
        &self.0
    }
}

impl Default for StaticKey {
    fn default() -> Self {
        Self(STATIC_KEY.to_string())
    }
}

impl<A> KeyResolver<A> for StaticKey {
    fn resolve(&self, _name: &str, _args: &A) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Resolves each call to a bucket named after the wrapped call, so
/// different functions sharing a throttle get separate quotas.
#[derive(Debug, Clone, Default)]
pub struct NameKey {
    prefix: String,
}

impl NameKey {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl<A> KeyResolver<A> for NameKey {
    fn resolve(&self, name: &str, _args: &A) -> Option<String> {
        Some(format!("{}{}", self.prefix, name))
    }
}
