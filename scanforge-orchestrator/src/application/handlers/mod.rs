pub mod scan;

pub use scan::ScanTaskHandler;
