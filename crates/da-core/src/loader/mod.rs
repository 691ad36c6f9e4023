//! Loader module - DA image parsing, selection and preloader EMI extraction.

pub mod emi;
pub mod image;
pub mod repository;

pub use emi::{EmiBlob, extract_emi};
pub use image::{
    EntryRegion, LoaderImage, Stage, StageImage, parse_loader_bytes, parse_loader_file,
};
pub use repository::LoaderRepository;
