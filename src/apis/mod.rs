pub mod sympla;

pub use sympla::{FetchReport, Page, SymplaClient};
