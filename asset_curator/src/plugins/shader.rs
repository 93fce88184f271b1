use std::{
    env,
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::{
    asset::AssetDocument,
    data_directory::normalize_path,
    document_generator::{
        default_output_file, AssetDocumentGenerator, ImportInput, ImportMode, ImportPriority,
        SupportedFileTypes,
    },
    document_type::{AssetDocumentType, TempFile, TransformContext, TransformOutcome},
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ShaderProperties {
    /// Relative to the data directory. Also listed as transform dependency.
    pub source: String,
    /// Passed to glslc when the extension doesn't tell the stage.
    #[serde(default)]
    pub stage: Option<String>,
}

/// GLSL compiled to SPIR-V with glslc. Set `GLSLC` to use a glslc that is not on the path.
pub struct ShaderDocumentType;

impl AssetDocumentType for ShaderDocumentType {
    fn asset_type(&self) -> &str {
        "Shader"
    }

    fn document_extension(&self) -> &str {
        "shader_asset"
    }

    fn output_extension(&self) -> &str {
        "spv"
    }

    fn transform(
        &self,
        context: &TransformContext<'_>,
        output: &mut dyn Write,
    ) -> anyhow::Result<TransformOutcome> {
        let Ok(properties) =
            serde_json::from_value::<ShaderProperties>(context.document.properties.clone())
        else {
            return Ok(TransformOutcome::NeedsImport);
        };
        let Some(input_path) = find_source(context.file_dependencies, &properties.source) else {
            return Ok(TransformOutcome::NeedsImport);
        };
        log::info!("Compiling shader {:?}", input_path);

        let scratch = env::temp_dir().join(format!("asset_curator-{}", context.guid));
        let output_path = TempFile::new(scratch.with_extension("spv"));
        let output_d_path = TempFile::new(scratch.with_extension("d"));

        let mut command = Command::new(env::var_os("GLSLC").unwrap_or_else(|| "glslc".into()));
        command
            .arg("-c") // Compile the shader
            .arg("-MD") // And also generate makefile dependencies
            .arg(input_path)
            .arg("-o")
            .arg(output_path.path())
            .arg("-MF")
            .arg(output_d_path.path())
            .arg("-MT") // And simplify the makefile dependency file
            .arg("shader");
        if let Some(stage) = &properties.stage {
            command.arg(format!("-fshader-stage={}", stage));
        }
        let status = command.status().context("failed to run glslc")?;
        if !status.success() {
            bail!("Shader compilation for {:?} failed: {}", input_path, status);
        }

        // Includes are only checked, the document decides what the dependencies are.
        let depfile = std::fs::read_to_string(output_d_path.path())?;
        let includes = parse_depfile(&depfile)
            .ok_or_else(|| anyhow::format_err!("Invalid dependency file for {:?}", input_path))?;
        for include in includes {
            let include = include.canonicalize().unwrap_or(include);
            if &include != input_path && !context.file_dependencies.contains(&include) {
                log::warn!(
                    "{:?} includes {:?}, which is not a transform dependency of {:?}",
                    input_path,
                    include,
                    context.document_path
                );
            }
        }

        io::copy(&mut File::open(output_path.path())?, output)?;
        Ok(TransformOutcome::Transformed)
    }
}

fn find_source<'a>(file_dependencies: &'a [PathBuf], source: &str) -> Option<&'a PathBuf> {
    let source = normalize_path(Path::new(source));
    file_dependencies.iter().find(|path| path.ends_with(&source))
}

/// Reads the prerequisites of the `shader:` rule glslc writes with `-MD -MT shader`.
fn parse_depfile(content: &str) -> Option<Vec<PathBuf>> {
    let prerequisites = content.trim_start().strip_prefix("shader:")?;
    let joined = prerequisites.replace("\\\r\n", " ").replace("\\\n", " ");

    let mut paths = Vec::new();
    let mut current = String::new();
    let mut chars = joined.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&' ') => {
                current.push(' ');
                chars.next();
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    paths.push(PathBuf::from(std::mem::take(&mut current)));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        paths.push(PathBuf::from(current));
    }
    Some(paths)
}

pub struct ShaderGenerator {
    file_types: SupportedFileTypes,
}

impl ShaderGenerator {
    pub fn new() -> Self {
        let mut file_types = SupportedFileTypes::new();
        file_types.add("glsl").add("vert").add("frag").add("comp");
        Self { file_types }
    }
}

impl Default for ShaderGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetDocumentGenerator for ShaderGenerator {
    fn supported_file_types(&self) -> &SupportedFileTypes {
        &self.file_types
    }

    fn document_extension(&self) -> &str {
        "shader_asset"
    }

    fn generator_group(&self) -> &str {
        "Shaders"
    }

    fn import_modes(&self, input: &Path) -> Vec<ImportMode> {
        vec![ImportMode {
            name: "ShaderImport.Shader".into(),
            display_name: "Shader".into(),
            priority: ImportPriority::HighPriority,
            output_file: default_output_file(input, self.document_extension()),
            generator: 0,
        }]
    }

    fn generate(&self, input: &ImportInput<'_>, _mode: &ImportMode) -> anyhow::Result<AssetDocument> {
        // We simply assume that it's a valid shader.
        // Compilation is done later, by the transform.
        let stage = match input.relative.extension() {
            Some(stage @ ("vert" | "frag" | "comp")) => Some(stage.to_string()),
            _ => None,
        };
        let mut document = AssetDocument::new("Shader");
        document.transform_dependencies.push(input.relative.to_string());
        document.properties = serde_json::to_value(ShaderProperties {
            source: input.relative.to_string(),
            stage,
        })?;
        Ok(document)
    }
}
