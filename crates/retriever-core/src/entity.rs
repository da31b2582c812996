//! A single entity and its retrieval state machine.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::callbacks::CallbackContext;
use crate::config::{DESTINATION_PARAMETER, EntityConfiguration};
use crate::error::AppError;
use crate::reporter::{RetrievalEvent, RetrievalReporter};
use crate::traits::Fetcher;
use crate::value::{OutputValue, Record};

/// Terminal result of [`Entity::retrieve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalOutcome {
    Accepted,
    PreRequestRejected,
    PostRequestRejected,
    Failed,
}

/// One row of work: its inputs, the values extracted for it, and links to
/// the entities it relates to within its collection.
#[derive(Debug, Clone)]
pub struct Entity {
    configuration: Arc<EntityConfiguration>,
    pub input_parameters: IndexMap<String, String>,
    pub output_parameters: Record,
    pub(crate) predecessor: Option<usize>,
    pub(crate) root_entity: Option<usize>,
    uri: Option<String>,
    response: Option<Value>,
    outcome: Option<RetrievalOutcome>,
}

impl Entity {
    /// Create an entity from its input values.
    ///
    /// Every declared input must be present. Values for range variables are
    /// kept as well, anything else is ignored. The request URI is computed
    /// once all range variables have a value.
    pub fn new(
        configuration: Arc<EntityConfiguration>,
        values: &IndexMap<String, String>,
    ) -> Result<Self, AppError> {
        let mut input_parameters = IndexMap::with_capacity(values.len());
        for name in configuration.input_names() {
            let value = values.get(name).ok_or_else(|| {
                AppError::config(format!(
                    "Input parameter {name} missing for entity of configuration {}",
                    configuration.name()
                ))
            })?;
            input_parameters.insert(name.to_string(), value.clone());
        }

        let mut expanded = true;
        for range_var in configuration.range_vars() {
            match values.get(&range_var.name) {
                Some(value) => {
                    input_parameters.insert(range_var.name.clone(), value.clone());
                }
                None => expanded = false,
            }
        }

        let uri = if expanded {
            Some(configuration.expand_uri(&input_parameters)?)
        } else {
            None
        };

        let output_parameters = configuration
            .output_parameter_mapping()
            .keys()
            .map(|name| (name.clone(), OutputValue::Missing))
            .collect();

        Ok(Self {
            configuration,
            input_parameters,
            output_parameters,
            predecessor: None,
            root_entity: None,
            uri,
            response: None,
            outcome: None,
        })
    }

    pub fn configuration(&self) -> &Arc<EntityConfiguration> {
        &self.configuration
    }

    /// Index of the entity processed right before this one.
    pub fn predecessor(&self) -> Option<usize> {
        self.predecessor
    }

    /// Index (into the collection's root arena) of the entity this one was
    /// expanded from.
    pub fn root_entity(&self) -> Option<usize> {
        self.root_entity
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// Parsed body of the last successful JSON request.
    pub fn response(&self) -> Option<&Value> {
        self.response.as_ref()
    }

    pub fn outcome(&self) -> Option<RetrievalOutcome> {
        self.outcome
    }

    /// Entities are duplicates when their input parameters are equal.
    pub fn same_inputs(&self, other: &Entity) -> bool {
        self.input_parameters == other.input_parameters
    }

    /// Run the retrieval state machine.
    ///
    /// Transport failures and unparsable bodies end in
    /// [`RetrievalOutcome::Failed`]. Only errors that make the whole run
    /// meaningless (a malformed filter path) are returned as `Err`.
    pub async fn retrieve<F: Fetcher, R: RetrievalReporter>(
        &mut self,
        predecessor: Option<&Entity>,
        fetcher: &F,
        reporter: &R,
    ) -> Result<RetrievalOutcome, AppError> {
        reporter.report(RetrievalEvent::Started { entity: self });
        let configuration = Arc::clone(&self.configuration);

        for callback in configuration.pre_request_callbacks() {
            let verdict = callback.call(&mut CallbackContext {
                entity: &mut *self,
                predecessor,
            });
            if configuration.pre_request_callback_filter() && verdict == Some(false) {
                reporter.report(RetrievalEvent::PreRequestRejected {
                    entity: self,
                    callback: callback.name(),
                });
                return Ok(self.finish(RetrievalOutcome::PreRequestRejected));
            }
        }

        let uri = match &self.uri {
            Some(uri) => uri.clone(),
            None => configuration.expand_uri(&self.input_parameters)?,
        };

        let delay = configuration.pacing_delay();
        reporter.report(RetrievalEvent::Requesting {
            entity: self,
            uri: &uri,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let body = match fetcher.fetch(&uri, configuration.headers()).await {
            Ok(body) => body,
            Err(error) if error.is_transport() => {
                reporter.report(RetrievalEvent::Failed {
                    entity: self,
                    error: &error,
                });
                return Ok(self.finish(RetrievalOutcome::Failed));
            }
            Err(error) => return Err(error),
        };
        reporter.report(RetrievalEvent::Retrieved {
            entity: self,
            bytes: body.len(),
        });

        if let Some(raw_parameter) = configuration.raw_parameter() {
            let destination = self.destination();
            self.output_parameters
                .insert(raw_parameter.to_string(), OutputValue::Bytes(body));
            self.output_parameters.insert(
                DESTINATION_PARAMETER.to_string(),
                OutputValue::String(destination),
            );
        } else {
            let json: Value = match serde_json::from_slice(&body) {
                Ok(json) => json,
                Err(e) => {
                    let error = AppError::from(e);
                    reporter.report(RetrievalEvent::Failed {
                        entity: self,
                        error: &error,
                    });
                    return Ok(self.finish(RetrievalOutcome::Failed));
                }
            };
            for (name, path) in configuration.output_parameter_mapping() {
                let value = path.apply(&json)?;
                self.output_parameters.insert(name.clone(), value);
            }
            self.response = Some(json);
        }

        for callback in configuration.post_request_callbacks() {
            let verdict = callback.call(&mut CallbackContext {
                entity: &mut *self,
                predecessor,
            });
            if configuration.apply_output_filter() && verdict == Some(false) {
                reporter.report(RetrievalEvent::PostRequestRejected {
                    entity: self,
                    callback: callback.name(),
                });
                return Ok(self.finish(RetrievalOutcome::PostRequestRejected));
            }
        }

        reporter.report(RetrievalEvent::Accepted { entity: self });
        Ok(self.finish(RetrievalOutcome::Accepted))
    }

    fn finish(&mut self, outcome: RetrievalOutcome) -> RetrievalOutcome {
        self.outcome = Some(outcome);
        outcome
    }

    /// Relative destination of a raw download: the configured input values
    /// joined as path segments.
    fn destination(&self) -> String {
        self.configuration
            .destination_path()
            .iter()
            .filter_map(|name| self.input_parameters.get(name))
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Input maps for the entities of a chained request.
    ///
    /// Scalars are selected from this entity's inputs and outputs. A
    /// flattened output yields one map per list element; when it is absent
    /// or empty no map is produced at all. An entity whose retrieval ended
    /// in anything but acceptance produces no map either.
    pub fn chained_inputs(
        &self,
        child: &EntityConfiguration,
    ) -> Result<Vec<IndexMap<String, String>>, AppError> {
        let Some(chained) = self.configuration.chained_request() else {
            return Err(AppError::config(format!(
                "Configuration {} has no chained request",
                self.configuration.name()
            )));
        };
        if chained.name != child.name() {
            return Err(AppError::config(format!(
                "Configuration <{}> provided, but <{}> needed for chained request",
                child.name(),
                chained.name
            )));
        }
        if let Some(outcome) = self.outcome.filter(|o| *o != RetrievalOutcome::Accepted) {
            tracing::warn!(entity = %self, ?outcome, "Entity not accepted, skipped for chained request");
            return Ok(Vec::new());
        }

        let mut scalars = IndexMap::new();
        for name in &chained.input_parameters {
            let value = self.input_parameters.get(name).ok_or_else(|| {
                AppError::config(format!("Input parameter for chained request not found: {name}"))
            })?;
            scalars.insert(name.clone(), value.clone());
        }
        for name in &chained.output_parameters {
            let value = self.output_parameters.get(name).ok_or_else(|| {
                AppError::config(format!("Output parameter for chained request not found: {name}"))
            })?;
            scalars.insert(name.clone(), value.to_cell());
        }

        let Some(flatten) = &chained.flatten_parameter else {
            return Ok(vec![scalars]);
        };

        let elements = match self.output_parameters.get(flatten) {
            None => {
                return Err(AppError::config(format!(
                    "Output parameter for chained request not found: {flatten}"
                )));
            }
            Some(value) if value.is_empty() => {
                tracing::info!(entity = %self, parameter = %flatten, "Nothing to flatten for chained request");
                return Ok(Vec::new());
            }
            Some(value) if value.is_record_list() => value.as_list().unwrap_or_default(),
            Some(_) => {
                return Err(AppError::config(format!(
                    "Parameter {flatten} should be flattened, but is not a list of records"
                )));
            }
        };

        let mut inputs = Vec::with_capacity(elements.len());
        for element in elements.iter().filter_map(OutputValue::as_record) {
            let mut map = scalars.clone();
            for (name, value) in element {
                if scalars.contains_key(name) {
                    return Err(AppError::config(format!(
                        "Inner parameter {name} of {flatten} already exists in chained input parameters"
                    )));
                }
                map.insert(name.clone(), value.to_cell());
            }
            inputs.push(map);
        }
        Ok(inputs)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.input_parameters.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        f.write_str("}")
    }
}
