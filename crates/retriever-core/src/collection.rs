//! Ordered collections of entities sharing one configuration.
//!
//! The collection owns the HTTP session used for all of its entities, the
//! pagination window applied while ingesting, and the arena of root entities
//! replaced by range-variable expansion.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::callbacks::CallbackRegistry;
use crate::config::{DESTINATION_PARAMETER, DOWNLOADED_PARAMETER, EntityConfiguration, InputParameter};
use crate::entity::{Entity, RetrievalOutcome};
use crate::error::AppError;
use crate::reporter::{RetrievalReporter, TracingReporter};
use crate::traits::Fetcher;
use crate::value::OutputValue;

/// Columns of a CSV export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSchema {
    /// Header, in export order.
    pub columns: Vec<String>,
    /// Parameters that are both input and output. The retrieved value is
    /// exported and compared against the input.
    pub validation: Vec<String>,
}

pub struct EntityCollection<F: Fetcher, R: RetrievalReporter = TracingReporter> {
    configuration: Arc<EntityConfiguration>,
    entities: Vec<Entity>,
    roots: Vec<Entity>,
    fetcher: F,
    reporter: R,
    start_index: usize,
    chunk_size: usize,
}

impl<F: Fetcher> EntityCollection<F> {
    pub fn new(configuration: Arc<EntityConfiguration>, fetcher: F) -> Self {
        Self {
            configuration,
            entities: Vec::new(),
            roots: Vec::new(),
            fetcher,
            reporter: TracingReporter,
            start_index: 0,
            chunk_size: 0,
        }
    }
}

impl<F: Fetcher, R: RetrievalReporter> EntityCollection<F, R> {
    pub fn with_reporter<R2: RetrievalReporter>(self, reporter: R2) -> EntityCollection<F, R2> {
        EntityCollection {
            configuration: self.configuration,
            entities: self.entities,
            roots: self.roots,
            fetcher: self.fetcher,
            reporter,
            start_index: self.start_index,
            chunk_size: self.chunk_size,
        }
    }

    /// Only import rows `[start_index, start_index + chunk_size)`. A chunk
    /// size of zero means "until the end".
    pub fn with_window(mut self, start_index: usize, chunk_size: usize) -> Self {
        self.start_index = start_index;
        self.chunk_size = chunk_size;
        self
    }

    pub fn configuration(&self) -> &Arc<EntityConfiguration> {
        &self.configuration
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn get(&self, index: usize) -> Option<&Entity> {
        self.entities.get(index)
    }

    /// The base entity a range-expanded entity was derived from.
    pub fn root(&self, index: usize) -> Option<&Entity> {
        self.roots.get(index)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Append an entity of the same configuration.
    pub fn add(&mut self, entity: Entity) -> Result<(), AppError> {
        let same = Arc::ptr_eq(entity.configuration(), &self.configuration)
            || **entity.configuration() == *self.configuration;
        if !same {
            return Err(AppError::config(format!(
                "Entity of configuration {} cannot be added to collection of {}",
                entity.configuration().name(),
                self.configuration.name()
            )));
        }
        self.entities.push(entity);
        self.link_predecessors();
        Ok(())
    }

    /// Point every entity at the one processed right before it.
    pub fn link_predecessors(&mut self) {
        for (index, entity) in self.entities.iter_mut().enumerate() {
            entity.predecessor = index.checked_sub(1);
        }
    }

    fn is_duplicate(&self, entity: &Entity) -> bool {
        self.configuration.ignore_input_duplicates()
            && self.entities.iter().any(|e| e.same_inputs(entity))
    }

    fn window(&self) -> String {
        if self.chunk_size == 0 {
            format!("[{}, max]", self.start_index)
        } else {
            format!(
                "[{}, {}]",
                self.start_index,
                self.start_index + self.chunk_size - 1
            )
        }
    }

    // -----------------------------------------------------------------------
    // Ingest
    // -----------------------------------------------------------------------

    /// Import entities from a delimited file with a header row.
    ///
    /// Returns the number of entities added.
    pub async fn read_from_csv(&mut self, path: &Path, delimiter: u8) -> Result<usize, AppError> {
        let file = fs::File::open(path).map_err(|e| {
            AppError::config(format!("Failed to open input file {}: {e}", path.display()))
        })?;
        tracing::info!(path = %path.display(), window = %self.window(), "Reading entities");
        self.read_from_reader(file, delimiter).await
    }

    pub async fn read_from_reader<Rd: io::Read>(
        &mut self,
        reader: Rd,
        delimiter: u8,
    ) -> Result<usize, AppError> {
        let constants = self.resolve_input_parameters().await?;

        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .from_reader(reader);
        let header = csv_reader.headers()?.clone();
        let columns = self.column_indices(&header)?;

        let mut imported = 0;
        for (row, record) in csv_reader.records().enumerate() {
            if row < self.start_index {
                continue;
            }
            if self.chunk_size != 0 && row >= self.start_index + self.chunk_size {
                break;
            }
            let record = match record {
                Ok(record) => record,
                Err(e) if matches!(e.kind(), csv::ErrorKind::UnequalLengths { .. }) => {
                    tracing::warn!(row, error = %e, "Malformed row, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let mut values = constants.clone();
            let mut complete = true;
            for (name, index) in &columns {
                let value = record.get(*index).unwrap_or_default();
                if value.is_empty() {
                    tracing::warn!(row, parameter = %name, "No value for input parameter, skipping row");
                    complete = false;
                    break;
                }
                values.insert(name.clone(), value.to_string());
            }
            if !complete {
                continue;
            }

            let entity = Entity::new(Arc::clone(&self.configuration), &values)?;
            if self.is_duplicate(&entity) {
                tracing::debug!(%entity, "Ignoring duplicate input");
                continue;
            }
            self.entities.push(entity);
            imported += 1;
        }

        self.link_predecessors();
        tracing::info!(count = imported, "Entities imported");
        Ok(imported)
    }

    /// Map every column input to its position in the header. The header must
    /// contain exactly the column inputs, in any order.
    fn column_indices(&self, header: &csv::StringRecord) -> Result<Vec<(String, usize)>, AppError> {
        let expected: Vec<&str> = self.configuration.column_names().collect();
        if header.is_empty() && !expected.is_empty() {
            return Err(AppError::config("Missing header in CSV file"));
        }
        if header.len() != expected.len() {
            return Err(AppError::config(format!(
                "Wrong number of columns in CSV file: expected {}, got {}",
                expected.len(),
                header.len()
            )));
        }
        if let Some(unknown) = header.iter().find(|column| !expected.contains(column)) {
            return Err(AppError::config(format!("Unknown column name in CSV file: {unknown}")));
        }

        expected
            .iter()
            .map(|name| {
                header
                    .iter()
                    .position(|column| column == *name)
                    .map(|index| (name.to_string(), index))
                    .ok_or_else(|| AppError::config(format!("Column {name} missing in CSV file")))
            })
            .collect()
    }

    /// Fetch every resolved input parameter once.
    async fn resolve_input_parameters(&self) -> Result<IndexMap<String, String>, AppError> {
        let mut resolved = IndexMap::new();
        for parameter in self.configuration.input_parameters() {
            let InputParameter::Resolved { name, uri, filter } = parameter else {
                continue;
            };
            tracing::info!(parameter = %name, %uri, "Resolving input parameter");

            let body = self.fetcher.fetch(uri, &IndexMap::new()).await.map_err(|e| {
                AppError::config(format!("Could not retrieve data for input parameter {name}: {e}"))
            })?;
            let json: Value = serde_json::from_slice(&body).map_err(|e| {
                AppError::config(format!("Invalid JSON for input parameter {name}: {e}"))
            })?;
            let value = filter.apply(&json)?.to_cell();
            if value.is_empty() {
                return Err(AppError::config(format!("No value for input parameter {name}")));
            }
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }

    // -----------------------------------------------------------------------
    // Retrieval
    // -----------------------------------------------------------------------

    /// Replace every entity lacking range-variable values by one entity per
    /// value combination. The replaced entities move to the root arena.
    pub fn expand_range_vars(&mut self) -> Result<(), AppError> {
        let range_vars = self.configuration.range_vars();
        if range_vars.is_empty() {
            return Ok(());
        }

        let mut expanded = Vec::with_capacity(self.entities.len());
        for entity in std::mem::take(&mut self.entities) {
            let pending: Vec<_> = range_vars
                .iter()
                .filter(|r| !entity.input_parameters.contains_key(&r.name))
                .collect();
            if pending.is_empty() {
                expanded.push(entity);
                continue;
            }

            if let Some(empty) = pending.iter().find(|r| r.is_empty()) {
                tracing::warn!(%entity, range_var = %empty, "Range variable yields no values, entity dropped");
                self.roots.push(entity);
                continue;
            }

            let total = pending.iter().fold(1usize, |n, r| n.saturating_mul(r.len()));
            tracing::debug!(%entity, count = total, "Expanding range variables");
            let mut combinations = vec![entity.input_parameters.clone()];
            for range_var in pending {
                combinations = combinations
                    .iter()
                    .flat_map(|inputs| {
                        range_var.values().map(move |value| {
                            let mut inputs = inputs.clone();
                            inputs.insert(range_var.name.clone(), value.to_string());
                            inputs
                        })
                    })
                    .collect();
            }

            let root = self.roots.len();
            for inputs in &combinations {
                let mut child = Entity::new(Arc::clone(&self.configuration), inputs)?;
                child.root_entity = Some(root);
                expanded.push(child);
            }
            self.roots.push(entity);
        }

        self.entities = expanded;
        self.link_predecessors();
        Ok(())
    }

    /// Retrieve data for all entities, one at a time, then drop the rejected
    /// ones (and the failed ones when output filtering is enabled).
    pub async fn retrieve_data(&mut self) -> Result<(), AppError> {
        self.expand_range_vars()?;
        tracing::info!(
            configuration = %self.configuration.name(),
            count = self.entities.len(),
            "Retrieving data"
        );

        for index in 0..self.entities.len() {
            let (done, pending) = self.entities.split_at_mut(index);
            let Some(entity) = pending.first_mut() else {
                break;
            };
            entity
                .retrieve(done.last(), &self.fetcher, &self.reporter)
                .await?;
        }

        let drop_failed = self.configuration.apply_output_filter();
        let before = self.entities.len();
        self.entities.retain(|entity| match entity.outcome() {
            Some(RetrievalOutcome::PreRequestRejected | RetrievalOutcome::PostRequestRejected) => {
                false
            }
            Some(RetrievalOutcome::Failed) => !drop_failed,
            Some(RetrievalOutcome::Accepted) | None => true,
        });
        self.link_predecessors();

        tracing::info!(
            kept = self.entities.len(),
            removed = before - self.entities.len(),
            "Data retrieval finished"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Combinators
    // -----------------------------------------------------------------------

    /// Explode the first output holding a non-empty list of records into one
    /// sibling entity per element. Returns the flattened field.
    pub fn flatten_output(&mut self) -> Option<String> {
        let field = self.entities.iter().find_map(|entity| {
            entity
                .output_parameters
                .iter()
                .find(|(_, value)| value.is_record_list())
                .map(|(name, _)| name.clone())
        });
        let Some(field) = field else {
            tracing::info!("No list parameter to flatten");
            return None;
        };
        tracing::info!(parameter = %field, "Flattening output");

        let mut flattened = Vec::with_capacity(self.entities.len());
        for mut entity in std::mem::take(&mut self.entities) {
            let Some(OutputValue::List(elements)) = entity.output_parameters.shift_remove(&field)
            else {
                tracing::debug!(%entity, parameter = %field, "Nothing to flatten, entity dropped");
                continue;
            };
            for element in elements {
                let OutputValue::Record(fields) = element else {
                    tracing::warn!(%entity, parameter = %field, "Skipping list element that is not a record");
                    continue;
                };
                let mut sibling = entity.clone();
                sibling.output_parameters.extend(fields);
                flattened.push(sibling);
            }
        }

        self.entities = flattened;
        self.link_predecessors();
        Some(field)
    }

    /// Load the chained configuration from `<config_dir>/<name>.json` and run
    /// the chained request.
    pub async fn execute_chained_request(
        &self,
        config_dir: &Path,
        registry: &CallbackRegistry,
    ) -> Result<EntityCollection<F, R>, AppError> {
        let Some(chained) = self.configuration.chained_request() else {
            return Err(AppError::config(format!(
                "No chained request configured for {}",
                self.configuration.name()
            )));
        };
        let path = config_dir.join(format!("{}.json", chained.name));
        let configuration = EntityConfiguration::from_file(&path, registry)?;
        if configuration.name() != chained.name {
            return Err(AppError::config(format!(
                "Configuration name <{}> is not identical to chained request name <{}>",
                configuration.name(),
                chained.name
            )));
        }
        self.chain_with(Arc::new(configuration)).await
    }

    /// Derive the entities of the chained configuration from this
    /// collection and retrieve them with a fresh session.
    pub async fn chain_with(
        &self,
        configuration: Arc<EntityConfiguration>,
    ) -> Result<EntityCollection<F, R>, AppError> {
        tracing::info!(
            from = %self.configuration.name(),
            to = %configuration.name(),
            "Executing chained request"
        );
        let mut chained = EntityCollection {
            configuration: Arc::clone(&configuration),
            entities: Vec::new(),
            roots: Vec::new(),
            fetcher: self.fetcher.new_session()?,
            reporter: self.reporter.clone(),
            start_index: 0,
            chunk_size: 0,
        };

        for entity in &self.entities {
            for inputs in entity.chained_inputs(&configuration)? {
                let child = Entity::new(Arc::clone(&configuration), &inputs)?;
                if chained.is_duplicate(&child) {
                    continue;
                }
                chained.entities.push(child);
            }
        }
        chained.link_predecessors();
        chained.retrieve_data().await?;
        Ok(chained)
    }

    // -----------------------------------------------------------------------
    // Export
    // -----------------------------------------------------------------------

    /// Write raw downloads to `<output_dir>/<name>/<destination>` and mark
    /// every entity as downloaded or not.
    pub fn save_raw_files(&mut self, output_dir: &Path) -> Result<(), AppError> {
        if self.entities.is_empty() {
            tracing::info!("Nothing to export");
            return Ok(());
        }
        let Some(raw_parameter) = self.configuration.raw_parameter() else {
            return Err(AppError::config(format!(
                "Raw download not configured for {}",
                self.configuration.name()
            )));
        };

        let dir = output_dir.join(self.configuration.name());
        fs::create_dir_all(&dir)?;
        tracing::info!(dir = %dir.display(), "Exporting raw content");

        let mut written = 0;
        for entity in &mut self.entities {
            let downloaded = match entity.output_parameters.shift_remove(raw_parameter) {
                Some(OutputValue::Bytes(bytes)) => {
                    let destination = entity
                        .output_parameters
                        .get(DESTINATION_PARAMETER)
                        .and_then(OutputValue::as_str)
                        .unwrap_or_default();
                    match relative_destination(destination) {
                        Some(relative) => match write_file(&dir.join(relative), &bytes) {
                            Ok(()) => true,
                            Err(e) => {
                                tracing::error!(%entity, error = %e, "Writing raw content failed");
                                false
                            }
                        },
                        None => {
                            tracing::warn!(%entity, %destination, "Rejected destination path");
                            false
                        }
                    }
                }
                _ => false,
            };
            written += usize::from(downloaded);
            entity
                .output_parameters
                .insert(DOWNLOADED_PARAMETER.to_string(), OutputValue::Bool(downloaded));
        }

        tracing::info!(count = written, "Raw content exported");
        Ok(())
    }

    /// Reconcile the declared schema with what callbacks did to the outputs.
    ///
    /// Input columns come first and are never removed. Declared outputs
    /// absent from some entity are dropped, fields any entity gained are
    /// appended in first-seen order.
    pub fn export_columns(&self) -> ExportSchema {
        let config = &self.configuration;
        let mut columns: Vec<String> = config
            .input_names()
            .map(str::to_string)
            .chain(config.range_vars().iter().map(|r| r.name.clone()))
            .collect();

        let declared = config.output_parameter_mapping();
        let validation: Vec<String> = declared
            .keys()
            .filter(|name| columns.contains(name))
            .cloned()
            .collect();

        for name in declared.keys() {
            if validation.contains(name) {
                continue;
            }
            let removed = self
                .entities
                .iter()
                .any(|entity| !entity.output_parameters.contains_key(name));
            if !removed {
                columns.push(name.clone());
            }
        }

        for entity in &self.entities {
            for name in entity.output_parameters.keys() {
                if !declared.contains_key(name) && !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }

        ExportSchema {
            columns,
            validation,
        }
    }

    /// Export to `<output_dir>/<name>.csv` (or `<name>_<first>-<last>.csv`
    /// when chunking). Returns the written path, or `None` when there is
    /// nothing to export.
    pub fn write_to_csv(&self, output_dir: &Path, delimiter: u8) -> Result<Option<PathBuf>, AppError> {
        if self.entities.is_empty() {
            tracing::info!("Nothing to export");
            return Ok(None);
        }
        fs::create_dir_all(output_dir)?;

        let name = self.configuration.name();
        let file_name = if self.chunk_size == 0 {
            format!("{name}.csv")
        } else {
            let last = self.start_index + self.entities.len().min(self.chunk_size) - 1;
            format!("{name}_{}-{last}.csv", self.start_index)
        };
        let path = output_dir.join(file_name);

        tracing::info!(path = %path.display(), "Exporting entities");
        let written = self.write_to_writer(fs::File::create(&path)?, delimiter)?;
        tracing::info!(count = written, "Entities exported");
        Ok(Some(path))
    }

    /// Write the header and one row per entity. Returns the number of rows
    /// written; rows that fail to serialise are logged and skipped.
    pub fn write_to_writer<W: io::Write>(&self, writer: W, delimiter: u8) -> Result<usize, AppError> {
        let schema = self.export_columns();
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_writer(writer);
        writer.write_record(&schema.columns)?;

        let mut written = 0;
        for entity in &self.entities {
            validate(entity, &schema.validation);

            let row: Vec<String> = schema
                .columns
                .iter()
                .map(|column| {
                    if let Some(value) = entity.output_parameters.get(column) {
                        value.to_cell()
                    } else if let Some(value) = entity.input_parameters.get(column) {
                        value.clone()
                    } else {
                        String::new()
                    }
                })
                .collect();

            match writer.write_record(&row) {
                Ok(()) => written += 1,
                Err(e) => tracing::error!(%entity, error = %e, "Could not write entity"),
            }
        }
        writer.flush()?;
        Ok(written)
    }
}

/// Compare retrieved values of validation parameters with the inputs.
fn validate(entity: &Entity, parameters: &[String]) {
    for parameter in parameters {
        let expected = entity
            .input_parameters
            .get(parameter)
            .map(String::as_str)
            .unwrap_or_default();
        match entity.output_parameters.get(parameter) {
            Some(value) if !value.is_empty() => {
                let actual = value.to_cell();
                if actual == expected {
                    tracing::debug!(%entity, %parameter, "Validation successful");
                } else {
                    tracing::warn!(
                        %entity,
                        %parameter,
                        %expected,
                        %actual,
                        "Validation failed, retrieved value will be exported"
                    );
                }
            }
            _ => tracing::warn!(%entity, %parameter, "Validation failed: empty value"),
        }
    }
}

/// Split a destination into path segments, rejecting anything that could
/// leave the export directory.
fn relative_destination(destination: &str) -> Option<PathBuf> {
    if destination.is_empty() {
        return None;
    }
    let mut path = PathBuf::new();
    for segment in destination.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return None;
        }
        path.push(segment);
    }
    Some(path)
}

fn write_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    tracing::debug!(path = %path.display(), "Writing file");
    fs::write(path, bytes)
}
