//! Page rendering for pagemark: a Pdfium-backed document provider and the
//! compositor that paints annotation objects over a rendered page.

mod composite;
#[cfg(feature = "pdf")]
mod pdfium;

pub use composite::{composite, composite_with_preview, Overlay};
#[cfg(feature = "pdf")]
pub use pdfium::{PdfiumRenderFactory, PDFIUM_LIBRARY_ENV};

#[cfg(feature = "pdf")]
pub type PdfRenderFactory = PdfiumRenderFactory;
