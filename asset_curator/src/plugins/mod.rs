//! Asset types and generators that ship with the curator.

mod shader;
mod texture;

pub use shader::*;
pub use texture::*;

use crate::{document_generator::GeneratorRegistry, document_type::DocumentTypeRegistry};

pub fn builtin_document_types() -> DocumentTypeRegistry {
    DocumentTypeRegistry::new()
        .with_type(ShaderDocumentType)
        .with_type(TextureDocumentType)
        .with_type(DecalDocumentType)
}

pub fn builtin_generators() -> GeneratorRegistry {
    let mut registry = GeneratorRegistry::new();
    registry
        .register("ShaderGenerator", || Box::new(ShaderGenerator::new()))
        .register("TextureGenerator", || Box::new(TextureGenerator::new()))
        .register("DecalGenerator", || Box::new(DecalGenerator::new()));
    registry
}
