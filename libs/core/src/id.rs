use std::fmt;
use std::sync::Arc;

/// Produces invocation and instance ids.
///
/// Ids only need to be unique among what is concurrently in flight on one
/// broker; the default draws random v4 UUIDs.
#[derive(Clone)]
pub struct IdGenerator(Arc<dyn Fn() -> String + Send + Sync>);

impl IdGenerator {
    pub fn new(generate: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self(Arc::new(generate))
    }

    pub fn generate(&self) -> String {
        (self.0)()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(generate)
    }
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdGenerator")
    }
}

/// Fresh random id.
pub fn generate() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
