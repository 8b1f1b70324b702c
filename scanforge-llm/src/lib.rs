pub mod domain;
pub mod infrastructure;

pub use domain::*;
pub use infrastructure::prompts;
pub use infrastructure::providers::OllamaProvider;
pub use infrastructure::response_parser::ResponseParser;
