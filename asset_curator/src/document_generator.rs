use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use asset_common::AssetGuid;
use relative_path::{RelativePath, RelativePathBuf};

use crate::{
    asset::AssetDocument,
    asset_watcher::FileChangeReceiver,
    curator::AssetCurator,
    data_directory::{file_type_key, make_data_directory_relative},
    error::{CuratorError, Result},
};

/// How sure a generator is that a mode is what the user wants.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ImportPriority {
    /// Never picked automatically.
    Undecided,
    LowPriority,
    MediumPriority,
    HighPriority,
}

/// One way of turning a source file into an asset document.
#[derive(Clone, Debug, PartialEq)]
pub struct ImportMode {
    /// Identifier the generator understands, for example `TextureImport.Decal`.
    pub name: String,
    pub display_name: String,
    pub priority: ImportPriority,
    /// Where the new document goes.
    pub output_file: PathBuf,
    /// Index of the generator that proposed this mode, filled in when the options are collected.
    pub generator: usize,
}

/// All modes that produce the same kind of document from one source file.
#[derive(Clone, Debug)]
pub struct ImportGroupOptions {
    pub group: String,
    pub input_file_absolute: PathBuf,
    pub input_file_relative: RelativePathBuf,
    pub options: Vec<ImportMode>,
    /// `None` until somebody picked one.
    pub selected_option: Option<usize>,
}

/// The source file a document is generated from.
pub struct ImportInput<'a> {
    pub absolute: &'a Path,
    /// Relative to the data directory, which is what documents store.
    pub relative: &'a RelativePath,
}

/// Lower-cased file extensions, matched like [`file_type_key`].
#[derive(Clone, Debug, Default)]
pub struct SupportedFileTypes {
    extensions: BTreeSet<String>,
}

impl SupportedFileTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// With or without the leading dot.
    pub fn add(&mut self, extension: &str) -> &mut Self {
        self.extensions
            .insert(extension.trim_start_matches('.').to_lowercase());
        self
    }

    pub fn supports(&self, path: &Path) -> bool {
        file_type_key(path).is_some_and(|key| self.extensions.contains(&key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().map(String::as_str)
    }
}

/// Proposes how to create asset documents from raw source files, and creates them.
pub trait AssetDocumentGenerator: Send {
    fn supported_file_types(&self) -> &SupportedFileTypes;

    fn supports_file_type(&self, path: &Path) -> bool {
        self.supported_file_types().supports(path)
    }

    /// Extension of the documents this generator creates, without the dot.
    fn document_extension(&self) -> &str;

    /// Generators of the same group compete for the same source files.
    fn generator_group(&self) -> &str;

    fn import_modes(&self, input: &Path) -> Vec<ImportMode>;

    fn generate(&self, input: &ImportInput<'_>, mode: &ImportMode) -> anyhow::Result<AssetDocument>;
}

/// `input` with its extension replaced by the document extension.
pub fn default_output_file(input: &Path, document_extension: &str) -> PathBuf {
    input.with_extension(document_extension)
}

type GeneratorFactory = Box<dyn Fn() -> Box<dyn AssetDocumentGenerator> + Send + Sync>;

/// Generator factories, registered by the plugins at startup.
#[derive(Default)]
pub struct GeneratorRegistry {
    factories: Vec<(String, GeneratorFactory)>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn AssetDocumentGenerator> + Send + Sync + 'static,
    ) -> &mut Self {
        let name = name.into();
        if self.factories.iter().any(|(existing, _)| *existing == name) {
            log::warn!("Generator '{}' is registered twice", name);
        }
        self.factories.push((name, Box::new(factory)));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.iter().map(|(name, _)| name.as_str())
    }

    /// One instance of every registered generator, ordered by document extension.
    pub fn create_generators(&self) -> Vec<Box<dyn AssetDocumentGenerator>> {
        let mut generators: Vec<_> = self.factories.iter().map(|(_, factory)| factory()).collect();
        generators.sort_by_cached_key(|generator| generator.document_extension().to_lowercase());
        generators
    }
}

/// Collects the import modes of every generator for every file, grouped by generator
/// group and input file. Files outside of the data directories are skipped.
pub fn create_import_option_list(
    files: &[PathBuf],
    generators: &[Box<dyn AssetDocumentGenerator>],
    data_directories: &[PathBuf],
) -> Vec<ImportGroupOptions> {
    let mut groups: Vec<ImportGroupOptions> = Vec::new();
    for file in files {
        let absolute = fs::canonicalize(file).unwrap_or_else(|_| file.clone());
        let Some(relative) = make_data_directory_relative(&absolute, data_directories) else {
            log::debug!("Not importing {:?}, it is outside of the data directories", file);
            continue;
        };

        for (index, generator) in generators.iter().enumerate() {
            if !generator.supports_file_type(&absolute) {
                continue;
            }
            let group_name = generator.generator_group();
            let position = groups
                .iter()
                .position(|g| g.group == group_name && g.input_file_absolute == absolute);
            let position = position.unwrap_or_else(|| {
                groups.push(ImportGroupOptions {
                    group: group_name.to_string(),
                    input_file_absolute: absolute.clone(),
                    input_file_relative: relative.clone(),
                    options: Vec::new(),
                    selected_option: None,
                });
                groups.len() - 1
            });
            for mut mode in generator.import_modes(&absolute) {
                mode.generator = index;
                groups[position].options.push(mode);
            }
        }
    }
    groups
}

/// Sorts for display, then picks an option wherever the choice is obvious.
pub fn sort_and_select_best_import_option(groups: &mut [ImportGroupOptions]) {
    groups.sort_by(|a, b| a.input_file_relative.cmp(&b.input_file_relative));
    for group in groups {
        group
            .options
            .sort_by_cached_key(|option| option.display_name.to_lowercase());
        group.selected_option = select_best_option(&group.options);
    }
}

/// The highest priority level that has any candidates decides. Exactly one candidate wins,
/// several candidates leave the choice to the user.
pub fn select_best_option(options: &[ImportMode]) -> Option<usize> {
    for priority in [
        ImportPriority::HighPriority,
        ImportPriority::MediumPriority,
        ImportPriority::LowPriority,
    ] {
        let mut candidates = options
            .iter()
            .enumerate()
            .filter(|(_, option)| option.priority == priority);
        match (candidates.next(), candidates.next()) {
            (None, _) => continue,
            (Some((index, _)), None) => return Some(index),
            (Some(_), Some(_)) => return None,
        }
    }
    None
}

/// Outcome of [`DocumentImporter::import_assets`].
#[derive(Debug, Default)]
pub struct ImportReport {
    /// Input file and the asset that was created for it.
    pub imported: Vec<(PathBuf, AssetGuid)>,
    /// Groups where the user has to pick an option, then call [`DocumentImporter::import`].
    pub undecided: Vec<ImportGroupOptions>,
    pub failed: Vec<(PathBuf, CuratorError)>,
}

/// Owns one instance of every generator and turns source files into registered asset documents.
pub struct DocumentImporter {
    curator: Arc<AssetCurator>,
    generators: Vec<Box<dyn AssetDocumentGenerator>>,
    documents_to_open: Vec<PathBuf>,
}

impl DocumentImporter {
    pub fn new(curator: Arc<AssetCurator>, registry: &GeneratorRegistry) -> Self {
        log::debug!(
            "Document generators: {}",
            registry.names().collect::<Vec<_>>().join(", ")
        );
        Self {
            curator,
            generators: registry.create_generators(),
            documents_to_open: Vec::new(),
        }
    }

    pub fn generators(&self) -> &[Box<dyn AssetDocumentGenerator>] {
        &self.generators
    }

    pub fn create_import_option_list(&self, files: &[PathBuf]) -> Vec<ImportGroupOptions> {
        create_import_option_list(files, &self.generators, self.curator.data_directories())
    }

    /// Generates and writes the document for `input`, and hands it to the curator.
    pub fn import(&mut self, input: &Path, mode: &ImportMode, open_document: bool) -> Result<AssetGuid> {
        let generator = self
            .generators
            .get(mode.generator)
            .ok_or_else(|| CuratorError::UnsupportedFileType(input.to_path_buf()))?;
        if !generator.supports_file_type(input) {
            return Err(CuratorError::UnsupportedFileType(input.to_path_buf()));
        }
        let relative = make_data_directory_relative(input, self.curator.data_directories())
            .ok_or_else(|| CuratorError::OutsideDataDirectories(input.to_path_buf()))?;
        if mode.output_file.exists() {
            return Err(CuratorError::io(
                &mode.output_file,
                io::Error::new(io::ErrorKind::AlreadyExists, "asset document already exists"),
            ));
        }

        let document = generator
            .generate(
                &ImportInput {
                    absolute: input,
                    relative: &relative,
                },
                mode,
            )
            .map_err(|source| CuratorError::GenerationFailed {
                path: input.to_path_buf(),
                source,
            })?;

        let produced_extension = self
            .curator
            .document_types()
            .get(&document.header.asset_type)
            .map(|document_type| document_type.document_extension().to_lowercase());
        if produced_extension.as_deref() != Some(generator.document_extension().to_lowercase().as_str()) {
            return Err(CuratorError::WrongDocumentKind {
                expected: generator.document_extension().to_string(),
                actual: document.header.asset_type.clone(),
            });
        }

        document.write(&mode.output_file)?;
        log::info!("Imported {:?} as {:?}", input, mode.output_file);
        self.curator.handle_single_file(&mode.output_file);
        if open_document {
            self.documents_to_open.push(mode.output_file.clone());
        }
        Ok(document.guid())
    }

    /// Imports every file whose import mode is obvious. A failing file doesn't stop the others.
    pub fn import_assets(&mut self, files: &[PathBuf]) -> ImportReport {
        let mut groups = self.create_import_option_list(files);
        sort_and_select_best_import_option(&mut groups);

        let mut report = ImportReport::default();
        for file in files {
            let absolute = fs::canonicalize(file).unwrap_or_else(|_| file.clone());
            let inside_data = make_data_directory_relative(&absolute, self.curator.data_directories()).is_some();
            if inside_data && !groups.iter().any(|group| group.input_file_absolute == absolute) {
                report
                    .failed
                    .push((file.clone(), CuratorError::UnsupportedFileType(file.clone())));
            }
        }

        for group in groups {
            let Some(selected) = group.selected_option else {
                report.undecided.push(group);
                continue;
            };
            let mode = &group.options[selected];
            match self.import(&group.input_file_absolute, mode, false) {
                Ok(guid) => report.imported.push((group.input_file_absolute.clone(), guid)),
                Err(err) => {
                    log::warn!("Importing {:?} failed: {}", group.input_file_absolute, err);
                    report.failed.push((group.input_file_absolute.clone(), err));
                }
            }
        }
        report
    }

    /// Documents that were imported with `open_document` since the last call.
    pub fn take_documents_to_open(&mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.documents_to_open)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use asset_common::TransformState;

    use crate::{
        assets_config::AssetsConfig,
        document_type::{AssetDocumentType, DocumentTypeRegistry, TransformContext, TransformOutcome},
    };

    use super::*;

    fn mode(name: &str, priority: ImportPriority) -> ImportMode {
        ImportMode {
            name: name.into(),
            display_name: name.into(),
            priority,
            output_file: PathBuf::new(),
            generator: 0,
        }
    }

    #[test]
    fn ties_are_never_resolved_automatically() {
        use ImportPriority::*;
        assert_eq!(select_best_option(&[mode("a", HighPriority), mode("b", HighPriority)]), None);
        assert_eq!(
            select_best_option(&[
                mode("a", LowPriority),
                mode("b", HighPriority),
                mode("c", LowPriority),
                mode("d", LowPriority),
            ]),
            Some(1)
        );
        assert_eq!(
            select_best_option(&[mode("a", LowPriority), mode("b", MediumPriority)]),
            Some(1)
        );
        assert_eq!(select_best_option(&[mode("a", Undecided)]), None);
        assert_eq!(select_best_option(&[]), None);
    }

    #[test]
    fn file_types_match_case_insensitively() {
        let mut types = SupportedFileTypes::new();
        types.add("PNG").add(".tga").add("makefile");
        assert!(types.supports(Path::new("/a/rock.png")));
        assert!(types.supports(Path::new("/a/ROCK.Png")));
        assert!(types.supports(Path::new("/a/b.TGA")));
        assert!(types.supports(Path::new("/a/Makefile")));
        assert!(!types.supports(Path::new("/a/rock.jpg")));
        assert!(!types.supports(Path::new("/a/png")));
    }

    struct Note;

    impl AssetDocumentType for Note {
        fn asset_type(&self) -> &str {
            "Note"
        }
        fn document_extension(&self) -> &str {
            "note_asset"
        }
        fn output_extension(&self) -> &str {
            "note"
        }
        fn transform(
            &self,
            _context: &TransformContext<'_>,
            _output: &mut dyn Write,
        ) -> anyhow::Result<TransformOutcome> {
            Ok(TransformOutcome::Transformed)
        }
    }

    /// Proposes notes for text files, a sticky note with high priority for `*sticky*`.
    struct NoteGenerator {
        types: SupportedFileTypes,
        extension: &'static str,
        asset_type: &'static str,
    }

    impl NoteGenerator {
        fn boxed(extension: &'static str, asset_type: &'static str) -> Box<dyn AssetDocumentGenerator> {
            let mut types = SupportedFileTypes::new();
            types.add("txt");
            Box::new(Self {
                types,
                extension,
                asset_type,
            })
        }
    }

    impl AssetDocumentGenerator for NoteGenerator {
        fn supported_file_types(&self) -> &SupportedFileTypes {
            &self.types
        }
        fn document_extension(&self) -> &str {
            self.extension
        }
        fn generator_group(&self) -> &str {
            "Text"
        }
        fn import_modes(&self, input: &Path) -> Vec<ImportMode> {
            let sticky = input.to_string_lossy().contains("sticky");
            let output_file = default_output_file(input, self.extension);
            vec![
                ImportMode {
                    name: "Note.Plain".into(),
                    display_name: "plain note".into(),
                    priority: if sticky {
                        ImportPriority::LowPriority
                    } else {
                        ImportPriority::MediumPriority
                    },
                    output_file: output_file.clone(),
                    generator: 0,
                },
                ImportMode {
                    name: "Note.Sticky".into(),
                    display_name: "Sticky note".into(),
                    priority: if sticky {
                        ImportPriority::HighPriority
                    } else {
                        ImportPriority::MediumPriority
                    },
                    output_file,
                    generator: 0,
                },
            ]
        }
        fn generate(&self, input: &ImportInput<'_>, mode: &ImportMode) -> anyhow::Result<AssetDocument> {
            let mut document = AssetDocument::new(self.asset_type);
            document.transform_dependencies.push(input.relative.to_string());
            document.properties = serde_json::json!({ "mode": mode.name });
            Ok(document)
        }
    }

    fn project() -> (tempfile::TempDir, Arc<AssetCurator>) {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(data.join("notes")).unwrap();
        let config = AssetsConfig {
            data_directories: vec![data.to_string_lossy().into_owned()],
            target: dir.path().join("target"),
            ..Default::default()
        };
        let curator = AssetCurator::new(config, DocumentTypeRegistry::new().with_type(Note)).unwrap();
        curator.open_project().unwrap();
        (dir, Arc::new(curator))
    }

    #[test]
    fn generators_are_sorted_by_document_extension() {
        let mut registry = GeneratorRegistry::new();
        registry
            .register("zeta", || NoteGenerator::boxed("Zeta_asset", "Note"))
            .register("alpha", || NoteGenerator::boxed("alpha_asset", "Note"))
            .register("Beta", || NoteGenerator::boxed("BETA_asset", "Note"));
        let extensions: Vec<String> = registry
            .create_generators()
            .iter()
            .map(|generator| generator.document_extension().to_string())
            .collect();
        assert_eq!(extensions, ["alpha_asset", "BETA_asset", "Zeta_asset"]);
    }

    #[test]
    fn options_are_grouped_per_file_and_generator_group() {
        let (dir, curator) = project();
        let data = curator.data_directories()[0].clone();
        fs::write(data.join("notes/b.txt"), "b").unwrap();
        fs::write(data.join("notes/a_sticky.txt"), "a").unwrap();
        fs::write(dir.path().join("outside.txt"), "x").unwrap();
        let generators = vec![
            NoteGenerator::boxed("note_asset", "Note"),
            NoteGenerator::boxed("other_asset", "Note"),
        ];

        let mut groups = create_import_option_list(
            &[data.join("notes/b.txt"), data.join("notes/a_sticky.txt"), dir.path().join("outside.txt")],
            &generators,
            curator.data_directories(),
        );
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|group| group.options.len() == 4));

        sort_and_select_best_import_option(&mut groups);
        assert_eq!(groups[0].input_file_relative, RelativePathBuf::from("notes/a_sticky.txt"));
        assert_eq!(groups[0].options[0].display_name, "plain note");
        // Two generators both propose a sticky note with high priority.
        assert_eq!(groups[0].selected_option, None);
        assert_eq!(groups[1].selected_option, None);
    }

    #[test]
    fn import_writes_and_registers_the_document() {
        let (_dir, curator) = project();
        let data = curator.data_directories()[0].clone();
        let input = data.join("notes/todo_sticky.txt");
        fs::write(&input, "buy milk").unwrap();
        let mut registry = GeneratorRegistry::new();
        registry.register("note", || NoteGenerator::boxed("note_asset", "Note"));
        let mut importer = DocumentImporter::new(curator.clone(), &registry);

        let report = importer.import_assets(&[input.clone(), data.join("notes/missing.png")]);
        assert_eq!(report.imported.len(), 1);
        assert!(report.undecided.is_empty());
        assert_eq!(report.failed.len(), 1);

        let guid = report.imported[0].1;
        let document_path = data.join("notes/todo_sticky.note_asset");
        assert_eq!(curator.find_asset_by_path(&document_path), Some(guid));
        assert_eq!(curator.asset_state(guid), Some(TransformState::NeedsTransform));
        let document = AssetDocument::read(&document_path).unwrap();
        assert_eq!(document.transform_dependencies, ["notes/todo_sticky.txt"]);
        assert_eq!(document.properties["mode"], "Note.Sticky");

        // The document exists now.
        let modes = importer.generators()[0].import_modes(&input);
        assert!(matches!(
            importer.import(&input, &modes[0], true),
            Err(CuratorError::Io { .. })
        ));
        assert!(importer.take_documents_to_open().is_empty());
    }

    #[test]
    fn import_rejects_wrong_document_kinds_and_file_types() {
        let (_dir, curator) = project();
        let data = curator.data_directories()[0].clone();
        let input = data.join("notes/a.txt");
        fs::write(&input, "a").unwrap();
        let mut registry = GeneratorRegistry::new();
        registry.register("liar", || NoteGenerator::boxed("note_asset", "Sound"));
        let mut importer = DocumentImporter::new(curator.clone(), &registry);

        let modes = importer.generators()[0].import_modes(&input);
        assert!(matches!(
            importer.import(&input, &modes[0], true),
            Err(CuratorError::WrongDocumentKind { .. })
        ));
        assert!(matches!(
            importer.import(&data.join("notes/a.png"), &modes[0], true),
            Err(CuratorError::UnsupportedFileType(_))
        ));
        assert!(!data.join("notes/a.note_asset").exists());
    }
}
