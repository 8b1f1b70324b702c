pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::handlers::{
    AiScanHandler, FetchCvesHandler, GenerateTemplateHandler, GeneratedTemplate,
    PipelineRootHandler, RefineTemplateHandler, RunSummary, StoreTemplatesHandler,
    StoredTemplate, ValidateTemplateHandler,
};
pub use application::pipeline::{PipelineMetrics, PipelineRun, RunState, TemplatePipeline, TriggerKind};
pub use domain::cve::CveRecord;
pub use domain::template::{Template, TemplateDoc, TemplateError, TemplateOrigin, ValidationState};
pub use infrastructure::feed::{CveFeedClient, FeedError};
pub use infrastructure::library::{LibraryError, TemplateLibrary};
