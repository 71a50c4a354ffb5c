use crate::{
    config::ServerConfig, context::ServerContextBuilder, mapping::Mapping, AnyResult,
};

/// A protocol module plugged into the server at startup.
///
/// `initialize` registers the module's detector (and anything else it needs)
/// on the context builder; `find_target` resolves a request path against the
/// module's own routing table.
pub trait ServerModule {
    type Target;

    fn name(&self) -> &'static str;

    fn initialize(
        &mut self,
        config: &ServerConfig,
        context: &mut ServerContextBuilder,
    ) -> AnyResult<()>;

    fn find_target(&self, path: &str) -> Option<Mapping<'_, Self::Target>>;
}
