mod controller;
mod stream;
mod transformer;

pub use controller::TransformStreamDefaultController;
pub use stream::TransformStream;
pub use transformer::{IdentityTransformer, Transformer};
