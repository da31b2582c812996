//! Declarative entity configuration.
//!
//! A configuration specifies the input parameters of an entity, how to
//! request data about it (URI template, API keys, headers), which output
//! parameters to extract from the response (filter paths), the callbacks to
//! run around the request, and optionally a chained request.
//!
//! Configuration files are JSON with `//` and `/* */` comments allowed.

use std::path::Path;
use std::time::Duration;

use indexmap::IndexMap;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;

use crate::callbacks::{CallbackRegistry, NamedCallback};
use crate::error::AppError;
use crate::filter::FilterPath;
use crate::range_var::RangeVar;
use crate::uri_template::{UriTemplate, api_key_slot};

/// Suffix marking a list-valued output to explode in a chained request.
pub const FLATTEN_OPERATOR: &str = "._";

/// Output key holding the destination path of a raw download.
pub const DESTINATION_PARAMETER: &str = "destination";

/// Output key added by raw export to flag whether a file was written.
pub const DOWNLOADED_PARAMETER: &str = "downloaded";

/// A declared input parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum InputParameter {
    /// Read from the CSV column of the same name.
    Column(String),
    /// Resolved once for all rows by fetching `uri` and applying `filter`.
    Resolved {
        name: String,
        uri: String,
        filter: FilterPath,
    },
}

impl InputParameter {
    pub fn name(&self) -> &str {
        match self {
            InputParameter::Column(name) => name,
            InputParameter::Resolved { name, .. } => name,
        }
    }
}

/// How to derive the inputs of a follow-up configuration from an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainedRequest {
    /// Name of the configuration to chain to.
    pub name: String,
    /// Parent input parameters copied to the child.
    pub input_parameters: Vec<String>,
    /// Parent output parameters copied to the child.
    pub output_parameters: Vec<String>,
    /// Parent output (without the `._` suffix) to explode into one child per
    /// list element.
    pub flatten_parameter: Option<String>,
}

/// A validated entity configuration. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityConfiguration {
    name: String,
    input_parameters: Vec<InputParameter>,
    uri_template: UriTemplate,
    range_vars: Vec<RangeVar>,
    api_keys: Vec<String>,
    headers: IndexMap<String, String>,
    output_parameter_mapping: IndexMap<String, FilterPath>,
    raw_parameter: Option<String>,
    destination_path: Vec<String>,
    pre_request_callbacks: Vec<NamedCallback>,
    post_request_callbacks: Vec<NamedCallback>,
    pre_request_callback_filter: bool,
    apply_output_filter: bool,
    ignore_input_duplicates: bool,
    delay_min: u64,
    delay_max: u64,
    flatten_output: bool,
    chained_request: Option<ChainedRequest>,
}

// ---- File format ----

#[derive(Deserialize)]
struct RawConfiguration {
    name: String,
    input_parameters: Vec<RawInputParameter>,
    uri_template: String,
    #[serde(default)]
    headers: IndexMap<String, String>,
    #[serde(default)]
    api_keys: Vec<String>,
    output_parameter_mapping: IndexMap<String, Value>,
    #[serde(default)]
    destination_path: Option<Vec<String>>,
    #[serde(default)]
    pre_request_callbacks: Vec<String>,
    #[serde(default)]
    post_request_callbacks: Vec<String>,
    #[serde(default)]
    pre_request_callback_filter: bool,
    #[serde(default)]
    apply_output_filter: bool,
    #[serde(default)]
    ignore_input_duplicates: bool,
    #[serde(default)]
    delay: Option<(u64, u64)>,
    #[serde(default)]
    flatten_output: bool,
    #[serde(default)]
    chained_request: Option<RawChainedRequest>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawInputParameter {
    Column(String),
    Resolved(String, String, Value),
}

#[derive(Deserialize)]
struct RawChainedRequest {
    name: Option<String>,
    input_parameters: Option<RawChainedInputs>,
}

#[derive(Deserialize)]
struct RawChainedInputs {
    #[serde(default)]
    input_parameters: Vec<String>,
    #[serde(default)]
    output_parameters: Vec<String>,
}

impl EntityConfiguration {
    /// Load a configuration file.
    pub fn from_file(path: &Path, registry: &CallbackRegistry) -> Result<Self, AppError> {
        tracing::info!(path = %path.display(), "Reading entity configuration");
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::config(format!(
                "Failed to read configuration file {}: {e}",
                path.display()
            ))
        })?;
        let config = Self::from_json_str(&text, registry)?;
        tracing::info!(name = %config.name, "Entity configuration imported");
        Ok(config)
    }

    /// Parse a configuration document. Comments are stripped first.
    pub fn from_json_str(text: &str, registry: &CallbackRegistry) -> Result<Self, AppError> {
        let stripped = json_comments::StripComments::new(text.as_bytes());
        let value: Value = serde_json::from_reader(stripped)
            .map_err(|e| AppError::config(format!("Invalid JSON in configuration: {e}")))?;
        Self::from_value(value, registry)
    }

    /// Build a configuration from an already parsed JSON document.
    pub fn from_value(value: Value, registry: &CallbackRegistry) -> Result<Self, AppError> {
        let raw: RawConfiguration = serde_json::from_value(value)
            .map_err(|e| AppError::config(format!("Reading configuration failed: {e}")))?;
        Self::from_raw(raw, registry)
    }

    fn from_raw(raw: RawConfiguration, registry: &CallbackRegistry) -> Result<Self, AppError> {
        if raw.name.trim().is_empty() {
            return Err(AppError::config("Configuration name must not be empty"));
        }
        let name = raw.name;

        // Inputs
        let mut input_parameters = Vec::with_capacity(raw.input_parameters.len());
        for parameter in raw.input_parameters {
            let parameter = match parameter {
                RawInputParameter::Column(name) => InputParameter::Column(name),
                RawInputParameter::Resolved(name, uri, filter) => {
                    let filter = FilterPath::from_json(&filter).map_err(|e| {
                        AppError::config(format!("Malformed URI input parameter {name}: {e}"))
                    })?;
                    InputParameter::Resolved { name, uri, filter }
                }
            };
            if input_parameters
                .iter()
                .any(|p: &InputParameter| p.name() == parameter.name())
            {
                return Err(AppError::config(format!(
                    "Input parameter {} declared twice",
                    parameter.name()
                )));
            }
            input_parameters.push(parameter);
        }
        let is_input = |n: &str| input_parameters.iter().any(|p| p.name() == n);

        // URI template
        let mut uri_template = UriTemplate::new(raw.uri_template);
        let range_vars = uri_template.rewrite_range_vars()?;
        for range_var in &range_vars {
            if is_input(&range_var.name) {
                return Err(AppError::config(format!(
                    "Range variable {} shadows an input parameter",
                    range_var.name
                )));
            }
        }
        for variable in uri_template.variables() {
            if is_input(&variable) || range_vars.iter().any(|r| r.name == variable) {
                continue;
            }
            match api_key_slot(&variable) {
                Some(slot) if slot < raw.api_keys.len() => {}
                Some(_) => {
                    return Err(AppError::config(format!(
                        "API key required for URI variable {variable}, but not configured"
                    )));
                }
                None => {
                    return Err(AppError::config(format!(
                        "URI variable {variable} is neither an input parameter, an API key, \
                         nor a range variable"
                    )));
                }
            }
        }

        // Outputs
        let mut output_parameter_mapping = IndexMap::with_capacity(raw.output_parameter_mapping.len());
        let mut raw_parameter = None;
        for (parameter, path) in raw.output_parameter_mapping {
            let path = FilterPath::from_json(&path).map_err(|e| {
                AppError::config(format!("Invalid filter for output parameter {parameter}: {e}"))
            })?;
            if path.is_raw_response() {
                if raw_parameter.is_some() {
                    return Err(AppError::config("Only one raw response parameter supported"));
                }
                raw_parameter = Some(parameter.clone());
            }
            output_parameter_mapping.insert(parameter, path);
        }

        let destination_path = match raw.destination_path {
            Some(names) => {
                for n in &names {
                    if !is_input(n) {
                        return Err(AppError::config(format!(
                            "Destination path parameter {n} is not an input parameter"
                        )));
                    }
                }
                names
            }
            None => input_parameters.iter().map(|p| p.name().to_string()).collect(),
        };

        // Callbacks
        let pre_request_callbacks = raw
            .pre_request_callbacks
            .iter()
            .map(|n| registry.resolve(n))
            .collect::<Result<Vec<_>, _>>()?;
        let post_request_callbacks = raw
            .post_request_callbacks
            .iter()
            .map(|n| registry.resolve(n))
            .collect::<Result<Vec<_>, _>>()?;

        validate_headers(&raw.headers)?;

        let (delay_min, delay_max) = raw.delay.unwrap_or((0, 0));
        if delay_min > delay_max {
            return Err(AppError::config(format!(
                "Invalid delay interval [{delay_min}, {delay_max}]"
            )));
        }

        let chained_request = raw.chained_request.map(parse_chained_request).transpose()?.flatten();

        Ok(Self {
            name,
            input_parameters,
            uri_template,
            range_vars,
            api_keys: raw.api_keys,
            headers: raw.headers,
            output_parameter_mapping,
            raw_parameter,
            destination_path,
            pre_request_callbacks,
            post_request_callbacks,
            pre_request_callback_filter: raw.pre_request_callback_filter,
            apply_output_filter: raw.apply_output_filter,
            ignore_input_duplicates: raw.ignore_input_duplicates,
            delay_min,
            delay_max,
            flatten_output: raw.flatten_output,
            chained_request,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_parameters(&self) -> &[InputParameter] {
        &self.input_parameters
    }

    /// Names of all declared inputs, in declaration order.
    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.input_parameters.iter().map(InputParameter::name)
    }

    /// Names of the inputs read from CSV columns.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.input_parameters.iter().filter_map(|p| match p {
            InputParameter::Column(name) => Some(name.as_str()),
            InputParameter::Resolved { .. } => None,
        })
    }

    pub fn is_input(&self, name: &str) -> bool {
        self.input_names().any(|n| n == name)
    }

    pub fn uri_template(&self) -> &UriTemplate {
        &self.uri_template
    }

    pub fn range_vars(&self) -> &[RangeVar] {
        &self.range_vars
    }

    pub fn api_keys(&self) -> &[String] {
        &self.api_keys
    }

    pub fn headers(&self) -> &IndexMap<String, String> {
        &self.headers
    }

    pub fn output_parameter_mapping(&self) -> &IndexMap<String, FilterPath> {
        &self.output_parameter_mapping
    }

    /// The output parameter receiving raw response bytes, if any.
    pub fn raw_parameter(&self) -> Option<&str> {
        self.raw_parameter.as_deref()
    }

    pub fn is_raw_download(&self) -> bool {
        self.raw_parameter.is_some()
    }

    pub fn destination_path(&self) -> &[String] {
        &self.destination_path
    }

    pub fn pre_request_callbacks(&self) -> &[NamedCallback] {
        &self.pre_request_callbacks
    }

    pub fn post_request_callbacks(&self) -> &[NamedCallback] {
        &self.post_request_callbacks
    }

    pub fn pre_request_callback_filter(&self) -> bool {
        self.pre_request_callback_filter
    }

    pub fn apply_output_filter(&self) -> bool {
        self.apply_output_filter
    }

    pub fn ignore_input_duplicates(&self) -> bool {
        self.ignore_input_duplicates
    }

    pub fn delay_bounds(&self) -> (u64, u64) {
        (self.delay_min, self.delay_max)
    }

    pub fn flatten_output(&self) -> bool {
        self.flatten_output
    }

    pub fn chained_request(&self) -> Option<&ChainedRequest> {
        self.chained_request.as_ref()
    }

    /// Uniformly random pacing delay in `[delay_min, delay_max]` milliseconds.
    pub fn pacing_delay(&self) -> Duration {
        let ms = if self.delay_max > self.delay_min {
            rand::thread_rng().gen_range(self.delay_min..=self.delay_max)
        } else {
            self.delay_min
        };
        Duration::from_millis(ms)
    }

    /// Expand the URI template for the given input values (API keys are
    /// added automatically).
    pub fn expand_uri(&self, inputs: &IndexMap<String, String>) -> Result<String, AppError> {
        let mut variables = inputs.clone();
        for variable in self.uri_template.variables() {
            if variables.contains_key(&variable) {
                continue;
            }
            if let Some(key) = api_key_slot(&variable).and_then(|slot| self.api_keys.get(slot)) {
                variables.insert(variable, key.clone());
            }
        }
        self.uri_template.expand(&variables)
    }
}

/// Header names and values must be valid on the wire.
fn validate_headers(headers: &IndexMap<String, String>) -> Result<(), AppError> {
    for (name, value) in headers {
        http::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AppError::config(format!("Invalid header name {name}: {e}")))?;
        http::HeaderValue::from_str(value)
            .map_err(|e| AppError::config(format!("Invalid value for header {name}: {e}")))?;
    }
    Ok(())
}

fn parse_chained_request(raw: RawChainedRequest) -> Result<Option<ChainedRequest>, AppError> {
    let (name, inputs) = match (raw.name, raw.input_parameters) {
        (None, None) => return Ok(None),
        (Some(name), Some(inputs)) => (name, inputs),
        (None, Some(_)) => {
            return Err(AppError::config(
                "Reading chained request from configuration failed: parameter name not found",
            ));
        }
        (Some(_), None) => {
            return Err(AppError::config(
                "Reading chained request from configuration failed: parameter input_parameters \
                 not found",
            ));
        }
    };

    let mut output_parameters = Vec::with_capacity(inputs.output_parameters.len());
    let mut flatten_parameter: Option<String> = None;
    for parameter in inputs.output_parameters {
        match parameter.strip_suffix(FLATTEN_OPERATOR) {
            Some(base) if !base.is_empty() && !base.contains(FLATTEN_OPERATOR) => {
                if let Some(existing) = &flatten_parameter {
                    return Err(AppError::config(format!(
                        "Only one flatten operator supported, but {existing} and {base} provided"
                    )));
                }
                flatten_parameter = Some(base.to_string());
            }
            _ if parameter.contains(FLATTEN_OPERATOR) => {
                return Err(AppError::config(format!(
                    "Wrong usage of flatten operator: expected <parameter>._, got {parameter}"
                )));
            }
            _ => output_parameters.push(parameter),
        }
    }

    Ok(Some(ChainedRequest {
        name,
        input_parameters: inputs.input_parameters,
        output_parameters,
        flatten_parameter,
    }))
}
