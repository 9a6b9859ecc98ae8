mod api;
mod provider;

pub(crate) use provider::OllamaClient;
