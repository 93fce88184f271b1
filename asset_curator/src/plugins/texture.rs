use std::{
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::{
    asset::AssetDocument,
    data_directory::{file_type_key, normalize_path},
    document_generator::{
        default_output_file, AssetDocumentGenerator, ImportInput, ImportMode, ImportPriority,
        SupportedFileTypes,
    },
    document_type::{AssetDocumentType, TransformContext, TransformOutcome},
};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub enum TextureUsage {
    Texture2D,
    NormalMap,
    Decal,
}

impl TextureUsage {
    fn mode_name(self) -> &'static str {
        match self {
            TextureUsage::Texture2D => "TextureImport.Texture2D",
            TextureUsage::NormalMap => "TextureImport.NormalMap",
            TextureUsage::Decal => "TextureImport.Decal",
        }
    }

    fn display_name(self) -> &'static str {
        match self {
            TextureUsage::Texture2D => "Texture 2D",
            TextureUsage::NormalMap => "Normal Map",
            TextureUsage::Decal => "Decal",
        }
    }

    fn from_mode_name(name: &str) -> Option<Self> {
        [Self::Texture2D, Self::NormalMap, Self::Decal]
            .into_iter()
            .find(|usage| usage.mode_name() == name)
    }

    /// How likely the file is meant to be used like this, going by its name.
    fn priority_for(self, input: &Path) -> ImportPriority {
        let name = input
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let is_normal_map = name.ends_with("_n") || name.contains("normal");
        let is_decal = name.contains("decal");
        match self {
            TextureUsage::NormalMap if is_normal_map => ImportPriority::HighPriority,
            TextureUsage::Decal if is_decal => ImportPriority::HighPriority,
            TextureUsage::Texture2D if !is_normal_map && !is_decal => ImportPriority::MediumPriority,
            _ => ImportPriority::LowPriority,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TextureProperties {
    /// Relative to the data directory. Also listed as transform dependency.
    pub source: String,
    pub usage: TextureUsage,
    #[serde(default)]
    pub srgb: bool,
}

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "tga", "dds"];
const COPY_CHUNK: usize = 64 * 1024;

/// Reads the properties and the source image of a texture-like document.
fn read_source<'a>(context: &TransformContext<'a>) -> Option<(TextureProperties, &'a PathBuf)> {
    let properties: TextureProperties =
        serde_json::from_value(context.document.properties.clone()).ok()?;
    let source = normalize_path(Path::new(&properties.source));
    let path = context
        .file_dependencies
        .iter()
        .find(|path| path.ends_with(&source))?;
    Some((properties, path))
}

/// Fails for files that don't look like what their extension says.
fn check_signature(path: &Path, header: &[u8]) -> anyhow::Result<()> {
    let expected: &[u8] = match file_type_key(path).as_deref() {
        Some("png") => b"\x89PNG\r\n\x1a\n",
        Some("jpg") | Some("jpeg") => b"\xff\xd8\xff",
        Some("dds") => b"DDS ",
        // TGA has no magic number.
        _ => return Ok(()),
    };
    if !header.starts_with(expected) {
        bail!("{:?} is not a valid {} file", path, file_type_key(path).unwrap_or_default());
    }
    Ok(())
}

/// Copies the image in chunks, so that a cancelled job stops early.
fn copy_image(
    context: &TransformContext<'_>,
    path: &Path,
    output: &mut dyn Write,
) -> anyhow::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; COPY_CHUNK];
    let mut first = true;
    loop {
        if context.is_cancelled() {
            return Ok(false);
        }
        let read = file.read(&mut buffer)?;
        if read == 0 {
            return Ok(true);
        }
        if first {
            check_signature(path, &buffer[..read])?;
            first = false;
        }
        output.write_all(&buffer[..read])?;
    }
}

fn transform_texture(
    context: &TransformContext<'_>,
    output: &mut dyn Write,
    expected_usage: impl Fn(TextureUsage) -> bool,
) -> anyhow::Result<TransformOutcome> {
    let Some((properties, source)) = read_source(context) else {
        return Ok(TransformOutcome::NeedsImport);
    };
    if !expected_usage(properties.usage) {
        return Ok(TransformOutcome::NeedsImport);
    }
    output.write_all(&[properties.usage as u8, properties.srgb as u8])?;
    copy_image(context, source, output)?;
    Ok(TransformOutcome::Transformed)
}

pub struct TextureDocumentType;

impl AssetDocumentType for TextureDocumentType {
    fn asset_type(&self) -> &str {
        "Texture"
    }

    fn document_extension(&self) -> &str {
        "texture_asset"
    }

    fn output_extension(&self) -> &str {
        "tex"
    }

    fn transform(
        &self,
        context: &TransformContext<'_>,
        output: &mut dyn Write,
    ) -> anyhow::Result<TransformOutcome> {
        transform_texture(context, output, |usage| usage != TextureUsage::Decal)
    }
}

/// Projected textures. The asset browser shows them with a thumbnail.
pub struct DecalDocumentType;

impl AssetDocumentType for DecalDocumentType {
    fn asset_type(&self) -> &str {
        "Decal"
    }

    fn document_extension(&self) -> &str {
        "decal_asset"
    }

    fn output_extension(&self) -> &str {
        "decal"
    }

    fn needs_thumbnail(&self) -> bool {
        true
    }

    fn transform(
        &self,
        context: &TransformContext<'_>,
        output: &mut dyn Write,
    ) -> anyhow::Result<TransformOutcome> {
        transform_texture(context, output, |usage| usage == TextureUsage::Decal)
    }

    fn create_thumbnail(
        &self,
        context: &TransformContext<'_>,
        output: &mut dyn Write,
    ) -> anyhow::Result<()> {
        // TODO: Scale the image down once there is an image decoder in the stack.
        let Some((_, source)) = read_source(context) else {
            bail!("decal {:?} has no source image", context.document_path);
        };
        copy_image(context, source, output)?;
        Ok(())
    }
}

fn image_file_types() -> SupportedFileTypes {
    let mut file_types = SupportedFileTypes::new();
    for extension in IMAGE_EXTENSIONS {
        file_types.add(extension);
    }
    file_types
}

fn image_mode(usage: TextureUsage, input: &Path, document_extension: &str) -> ImportMode {
    ImportMode {
        name: usage.mode_name().into(),
        display_name: usage.display_name().into(),
        priority: usage.priority_for(input),
        output_file: default_output_file(input, document_extension),
        generator: 0,
    }
}

fn image_document(
    asset_type: &str,
    input: &ImportInput<'_>,
    usage: TextureUsage,
) -> anyhow::Result<AssetDocument> {
    let mut document = AssetDocument::new(asset_type);
    document.transform_dependencies.push(input.relative.to_string());
    document.properties = serde_json::to_value(TextureProperties {
        source: input.relative.to_string(),
        usage,
        srgb: usage != TextureUsage::NormalMap,
    })?;
    Ok(document)
}

/// Images as plain textures or normal maps.
pub struct TextureGenerator {
    file_types: SupportedFileTypes,
}

impl TextureGenerator {
    pub fn new() -> Self {
        Self {
            file_types: image_file_types(),
        }
    }
}

impl Default for TextureGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetDocumentGenerator for TextureGenerator {
    fn supported_file_types(&self) -> &SupportedFileTypes {
        &self.file_types
    }

    fn document_extension(&self) -> &str {
        "texture_asset"
    }

    fn generator_group(&self) -> &str {
        "Images"
    }

    fn import_modes(&self, input: &Path) -> Vec<ImportMode> {
        [TextureUsage::Texture2D, TextureUsage::NormalMap]
            .into_iter()
            .map(|usage| image_mode(usage, input, self.document_extension()))
            .collect()
    }

    fn generate(&self, input: &ImportInput<'_>, mode: &ImportMode) -> anyhow::Result<AssetDocument> {
        match TextureUsage::from_mode_name(&mode.name) {
            Some(usage @ (TextureUsage::Texture2D | TextureUsage::NormalMap)) => {
                image_document("Texture", input, usage)
            }
            _ => bail!("unknown texture import mode '{}'", mode.name),
        }
    }
}

/// Images as decals. Shares the image group with [`TextureGenerator`].
pub struct DecalGenerator {
    file_types: SupportedFileTypes,
}

impl DecalGenerator {
    pub fn new() -> Self {
        Self {
            file_types: image_file_types(),
        }
    }
}

impl Default for DecalGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetDocumentGenerator for DecalGenerator {
    fn supported_file_types(&self) -> &SupportedFileTypes {
        &self.file_types
    }

    fn document_extension(&self) -> &str {
        "decal_asset"
    }

    fn generator_group(&self) -> &str {
        "Images"
    }

    fn import_modes(&self, input: &Path) -> Vec<ImportMode> {
        vec![image_mode(TextureUsage::Decal, input, self.document_extension())]
    }

    fn generate(&self, input: &ImportInput<'_>, mode: &ImportMode) -> anyhow::Result<AssetDocument> {
        if TextureUsage::from_mode_name(&mode.name) != Some(TextureUsage::Decal) {
            bail!("unknown decal import mode '{}'", mode.name);
        }
        let mut document = image_document("Decal", input, TextureUsage::Decal)?;
        document.thumbnail_dependencies.push(input.relative.to_string());
        Ok(document)
    }
}
