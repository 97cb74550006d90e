// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 audlink contributors

//! Operation registry and dispatcher.
//!
//! The registry is a closed table built once at startup: operation name,
//! required input keys, and the mapping from the engine's result to the
//! response's output parameters. Handlers never raise past the dispatcher;
//! every failure becomes a `return != 0` response with a single `error`
//! string.
//!
//! The numeric calculator itself sits behind [`ComputeEngine`]; the
//! dispatcher only validates parameters, invokes it, and shapes the result.

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{RequestEnvelope, ResponseEnvelope};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// How an operation's engine result maps into `output_parameters`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    /// Fixed-size numeric vector published under a single key.
    Vector { key: &'static str, len: usize },
    /// Single numeric value under one key.
    Scalar { key: &'static str },
    /// Named fields copied from the engine's result object; vector fields
    /// share `len` when one is declared.
    Fields {
        keys: &'static [&'static str],
        len: Option<usize>,
    },
    /// Mutating operation; replies `{"success": true}`.
    Ack,
}

/// One entry in the closed operation table.
#[derive(Debug)]
pub struct Operation {
    pub name: &'static str,
    pub required: &'static [&'static str],
    pub output: OutputShape,
}

use OutputShape::{Ack, Fields, Scalar, Vector};

/// The full calculator catalog. 19-point operations cover the standard
/// audiometric frequencies; the 9-point variants are the reduced set, and
/// input/output curves are sampled at 100 levels.
pub const OPERATIONS: &[Operation] = &[
    Operation {
        name: "dllVersion",
        required: &[],
        output: Fields { keys: &["major", "minor"], len: None },
    },
    Operation {
        name: "CrossOverFrequencies_NL2",
        required: &["channels", "AC", "BC"],
        output: Vector { key: "crossOverFreq", len: 19 },
    },
    Operation {
        name: "CenterFrequencies",
        required: &["channels", "CFArray"],
        output: Vector { key: "centerFreq", len: 18 },
    },
    Operation {
        name: "CompressionThreshold_NL2",
        required: &["WBCT", "aidType", "direction", "mic", "calcCh"],
        output: Vector { key: "CT", len: 19 },
    },
    Operation {
        name: "setBWC",
        required: &["channels", "crossOver", "bandwidth", "selection"],
        output: Ack,
    },
    Operation {
        name: "SetAdultChild",
        required: &["adultChild", "dateOfBirth"],
        output: Ack,
    },
    Operation {
        name: "SetExperience",
        required: &["experience"],
        output: Ack,
    },
    Operation {
        name: "SetCompSpeed",
        required: &["compSpeed"],
        output: Ack,
    },
    Operation {
        name: "SetTonalLanguage",
        required: &["tonal"],
        output: Ack,
    },
    Operation {
        name: "SetGender",
        required: &["gender"],
        output: Ack,
    },
    Operation {
        name: "GetRECDh_indiv_NL2",
        required: &["RECDmeasType", "dateOfBirth", "aidType", "tubing", "coupler", "fittingDepth"],
        output: Vector { key: "RECDh", len: 19 },
    },
    Operation {
        name: "GetRECDh_indiv9_NL2",
        required: &["RECDmeasType", "dateOfBirth", "aidType", "tubing", "coupler", "fittingDepth"],
        output: Vector { key: "RECDh", len: 9 },
    },
    Operation {
        name: "GetRECDt_indiv_NL2",
        required: &[
            "RECDmeasType", "dateOfBirth", "aidType", "tubing", "vent", "earpiece", "coupler",
            "fittingDepth",
        ],
        output: Vector { key: "RECDt", len: 19 },
    },
    Operation {
        name: "GetRECDt_indiv9_NL2",
        required: &[
            "RECDmeasType", "dateOfBirth", "aidType", "tubing", "vent", "earpiece", "coupler",
            "fittingDepth",
        ],
        output: Vector { key: "RECDt", len: 9 },
    },
    Operation {
        name: "SetRECDh_indiv_NL2",
        required: &["RECDh"],
        output: Ack,
    },
    Operation {
        name: "SetRECDh_indiv9_NL2",
        required: &["RECDh"],
        output: Ack,
    },
    Operation {
        name: "SetRECDt_indiv_NL2",
        required: &["RECDt"],
        output: Ack,
    },
    Operation {
        name: "SetRECDt_indiv9_NL2",
        required: &["RECDt"],
        output: Ack,
    },
    Operation {
        name: "CompressionRatio_NL2",
        required: &[
            "CR", "channels", "centerFreq", "AC", "BC", "direction", "mic", "limiting", "ACother",
            "noOfAids",
        ],
        output: Vector { key: "CR", len: 19 },
    },
    Operation {
        name: "getMPO_NL2",
        required: &[
            "type", "AC", "BC", "channels", "limiting", "ACother", "direction", "mic", "noOfAids",
        ],
        output: Vector { key: "MPO", len: 19 },
    },
    Operation {
        name: "RealEarAidedGain_NL2",
        required: &[
            "AC", "BC", "L", "limiting", "channels", "direction", "mic", "ACother", "noOfAids",
        ],
        output: Vector { key: "REAG", len: 19 },
    },
    // Speech level L defaults inside the engine when omitted.
    Operation {
        name: "RealEarInsertionGain_NL2",
        required: &[
            "AC", "BC", "limiting", "channels", "direction", "mic", "ACother", "noOfAids",
        ],
        output: Vector { key: "REIG", len: 19 },
    },
    Operation {
        name: "TccCouplerGain_NL2",
        required: &[
            "AC", "BC", "L", "limiting", "channels", "direction", "mic", "target", "aidType",
            "ACother", "noOfAids", "tubing", "vent", "RECDmeasType",
        ],
        output: Fields { keys: &["TccGain", "lineType"], len: Some(19) },
    },
    Operation {
        name: "EarSimulatorGain_NL2",
        required: &[
            "AC", "BC", "L", "direction", "mic", "limiting", "channels", "target", "aidType",
            "ACother", "noOfAids", "tubing", "vent", "RECDmeasType",
        ],
        output: Fields { keys: &["ESG", "lineType"], len: Some(19) },
    },
    Operation {
        name: "RealEarInputOutputCurve_NL2",
        required: &[
            "AC", "BC", "graphFreq", "startLevel", "finishLevel", "limiting", "channels",
            "direction", "mic", "target", "ACother", "noOfAids",
        ],
        output: Fields { keys: &["REIO", "REIOunl"], len: Some(100) },
    },
    Operation {
        name: "TccInputOutputCurve_NL2",
        required: &[
            "AC", "BC", "graphFreq", "startLevel", "finishLevel", "limiting", "channels",
            "direction", "mic", "target", "aidType", "ACother", "noOfAids", "tubing", "vent",
            "RECDmeasType",
        ],
        output: Fields { keys: &["TccIO", "TccIOunl", "lineType"], len: Some(100) },
    },
    Operation {
        name: "EarSimulatorInputOutputCurve_NL2",
        required: &[
            "AC", "BC", "graphFreq", "startLevel", "finishLevel", "limiting", "channels",
            "direction", "mic", "target", "aidType", "ACother", "noOfAids", "tubing", "vent",
            "RECDmeasType",
        ],
        output: Fields { keys: &["ESIO", "ESIOunl", "lineType"], len: Some(100) },
    },
    Operation {
        name: "Speech_o_Gram_NL2",
        required: &[
            "AC", "BC", "L", "limiting", "channels", "direction", "mic", "ACother", "noOfAids",
        ],
        output: Fields {
            keys: &["Speech_rms", "Speech_max", "Speech_min", "Speech_thresh"],
            len: Some(19),
        },
    },
    Operation {
        name: "AidedThreshold_NL2",
        required: &[
            "AC", "BC", "CT", "dbOption", "ACother", "noOfAids", "limiting", "channels",
            "direction", "mic",
        ],
        output: Vector { key: "AT", len: 19 },
    },
    Operation {
        name: "GetREDDindiv",
        required: &["defValues"],
        output: Vector { key: "REDD", len: 19 },
    },
    Operation {
        name: "GetREDDindiv9",
        required: &["defValues"],
        output: Vector { key: "REDD", len: 9 },
    },
    Operation {
        name: "GetREURindiv",
        required: &["defValues", "dateOfBirth", "direction", "mic"],
        output: Vector { key: "REUR", len: 19 },
    },
    Operation {
        name: "GetREURindiv9",
        required: &["defValues", "dateOfBirth", "direction", "mic"],
        output: Vector { key: "REUR", len: 9 },
    },
    Operation {
        name: "SetREDDindiv",
        required: &["REDD", "defValues"],
        output: Ack,
    },
    Operation {
        name: "SetREDDindiv9",
        required: &["REDD", "defValues"],
        output: Ack,
    },
    Operation {
        name: "SetREURindiv",
        required: &["REUR", "defValues", "dateOfBirth", "direction", "mic"],
        output: Ack,
    },
    Operation {
        name: "SetREURindiv9",
        required: &["REUR", "defValues", "dateOfBirth", "direction", "mic"],
        output: Ack,
    },
    Operation {
        name: "GainAt_NL2",
        required: &[
            "freqRequired", "targetType", "AC", "BC", "L", "limiting", "channels", "direction",
            "mic", "ACother", "noOfAids", "bandWidth", "target", "aidType", "tubing", "vent",
            "RECDmeasType",
        ],
        output: Scalar { key: "gain" },
    },
    Operation {
        name: "GetMLE",
        required: &["aidType", "direction", "mic"],
        output: Vector { key: "MLE", len: 19 },
    },
    Operation {
        name: "ReturnValues_NL2",
        required: &[],
        output: Fields { keys: &["MAF", "BWC", "ESCD"], len: Some(19) },
    },
    Operation {
        name: "GetTubing_NL2",
        required: &["tubing"],
        output: Vector { key: "Tubing", len: 19 },
    },
    Operation {
        name: "GetTubing9_NL2",
        required: &["tubing"],
        output: Vector { key: "Tubing", len: 9 },
    },
    Operation {
        name: "GetVentOut_NL2",
        required: &["vent"],
        output: Vector { key: "VentOut", len: 19 },
    },
    Operation {
        name: "GetVentOut9_NL2",
        required: &["vent"],
        output: Vector { key: "VentOut", len: 9 },
    },
    Operation {
        name: "Get_SI_NL2",
        required: &["s", "REAG", "Limit"],
        output: Scalar { key: "SI" },
    },
    Operation {
        name: "Get_SII",
        required: &["nCompSpeed", "Speech_thresh", "s", "REAG", "REAGp", "REAGm", "REUR"],
        output: Scalar { key: "SII" },
    },
];

/// Read-only name → operation lookup, built once.
pub struct OperationRegistry {
    table: HashMap<&'static str, &'static Operation>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        let table = OPERATIONS.iter().map(|op| (op.name, op)).collect();
        Self { table }
    }

    pub fn get(&self, name: &str) -> Option<&'static Operation> {
        self.table.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Domain error raised by the computation engine.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// The engine does not implement this operation.
    Unsupported(String),
    /// The calculation itself failed.
    Domain(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(name) => write!(f, "Operation not supported by engine: {}", name),
            Self::Domain(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

/// The external numeric calculator.
///
/// Every registry entry performs exactly one `invoke` and maps its result
/// deterministically; the engine's internals are out of scope here.
pub trait ComputeEngine: Send + Sync {
    fn invoke(&self, operation: &str, params: &Map<String, Value>) -> Result<Value, EngineError>;
}

/// Shape-correct stand-in engine used when no native calculator library is
/// linked: every numeric result is zero-filled at the operation's declared
/// size. Keeps the full request path exercisable end to end.
pub struct StubEngine {
    registry: OperationRegistry,
}

impl StubEngine {
    pub fn new() -> Self {
        Self {
            registry: OperationRegistry::new(),
        }
    }

    fn zeros(len: usize) -> Value {
        Value::Array(vec![Value::from(0.0); len])
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeEngine for StubEngine {
    fn invoke(&self, operation: &str, _params: &Map<String, Value>) -> Result<Value, EngineError> {
        let op = self
            .registry
            .get(operation)
            .ok_or_else(|| EngineError::Unsupported(operation.to_string()))?;

        Ok(match op.output {
            Vector { len, .. } => Self::zeros(len),
            Scalar { .. } => Value::from(0.0),
            Fields { keys, len } => {
                let mut obj = Map::new();
                for key in keys {
                    let field = match len {
                        Some(n) => Self::zeros(n),
                        None => Value::from(0.0),
                    };
                    obj.insert((*key).to_string(), field);
                }
                Value::Object(obj)
            }
            Ack => Value::Bool(true),
        })
    }
}

/// Validates parameters, invokes the engine, and shapes results into
/// response envelopes. Shared by every ingress path.
pub struct Dispatcher {
    registry: OperationRegistry,
    engine: Arc<dyn ComputeEngine>,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn ComputeEngine>) -> Self {
        Self {
            registry: OperationRegistry::new(),
            engine,
        }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Run one operation.
    pub fn dispatch(
        &self,
        function: &str,
        params: &Map<String, Value>,
    ) -> BridgeResult<Map<String, Value>> {
        let op = self
            .registry
            .get(function)
            .ok_or_else(|| BridgeError::UnknownOperation(function.to_string()))?;

        for key in op.required {
            if !params.contains_key(*key) {
                return Err(BridgeError::MissingParameter((*key).to_string()));
            }
        }

        debug!("Dispatching {}", function);
        let result = self
            .engine
            .invoke(function, params)
            .map_err(|e| BridgeError::Engine(e.to_string()))?;

        Ok(map_output(&op.output, result))
    }

    /// Run one operation and fold any failure into the response envelope.
    ///
    /// This is the transport-boundary form: it never fails, so no error
    /// crosses the wire as anything but a structured response.
    pub fn respond(&self, request: &RequestEnvelope) -> ResponseEnvelope {
        match self.dispatch(&request.function, &request.input_parameters) {
            Ok(output) => {
                ResponseEnvelope::success(request.sequence_num, &request.function, output)
            }
            Err(e) => {
                warn!("Dispatch failed for {}: {}", request.function, e);
                ResponseEnvelope::failure(request.sequence_num, &request.function, &e.to_string())
            }
        }
    }
}

fn map_output(shape: &OutputShape, result: Value) -> Map<String, Value> {
    let mut output = Map::new();
    match shape {
        Vector { key, .. } | Scalar { key } => {
            output.insert((*key).to_string(), result);
        }
        Fields { keys, .. } => {
            if let Value::Object(fields) = result {
                for key in *keys {
                    if let Some(value) = fields.get(*key) {
                        output.insert((*key).to_string(), value.clone());
                    }
                }
            }
        }
        Ack => {
            output.insert("success".into(), Value::Bool(true));
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(StubEngine::new()))
    }

    fn params(entries: &[(&str, Value)]) -> Map<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn registry_is_closed_and_complete() {
        let registry = OperationRegistry::new();
        assert_eq!(registry.len(), OPERATIONS.len());
        assert!(registry.get("dllVersion").is_some());
        assert!(registry.get("Nope").is_none());
    }

    #[test]
    fn unknown_operation_becomes_error_response() {
        let request = RequestEnvelope {
            sequence_num: 1,
            function: "Nope".into(),
            input_parameters: Map::new(),
        };
        let response = dispatcher().respond(&request);
        assert_eq!(response.ret, -1);
        assert_eq!(response.sequence_num, 1);
        assert_eq!(response.function, "Nope");
        assert!(response.output_parameters["error"]
            .as_str()
            .unwrap()
            .contains("Nope"));
    }

    #[test]
    fn missing_parameter_names_the_key() {
        let err = dispatcher()
            .dispatch("SetGender", &Map::new())
            .unwrap_err();
        match err {
            BridgeError::MissingParameter(key) => assert_eq!(key, "gender"),
            other => panic!("Unexpected error: {}", other),
        }
    }

    #[test]
    fn setter_acks_success() {
        let output = dispatcher()
            .dispatch("SetGender", &params(&[("gender", json!(1))]))
            .unwrap();
        assert_eq!(output["success"], Value::Bool(true));
    }

    #[test]
    fn vector_operation_outputs_under_declared_key() {
        let input = params(&[
            ("channels", json!(4)),
            ("AC", json!([0, 0, 0, 0, 0, 0, 0, 0, 0])),
            ("BC", json!([0, 0, 0, 0, 0, 0, 0, 0, 0])),
        ]);
        let output = dispatcher()
            .dispatch("CrossOverFrequencies_NL2", &input)
            .unwrap();
        assert_eq!(output["crossOverFreq"].as_array().unwrap().len(), 19);
    }

    #[test]
    fn response_echoes_request_identity() {
        let request = RequestEnvelope {
            sequence_num: 77,
            function: "dllVersion".into(),
            input_parameters: Map::new(),
        };
        let response = dispatcher().respond(&request);
        assert_eq!(response.sequence_num, 77);
        assert_eq!(response.function, "dllVersion");
        assert_eq!(response.ret, 0);
    }

    /// Every table entry with a declared fixed length produces exactly that
    /// many elements through a shape-correct engine.
    #[test]
    fn declared_output_shapes_hold() {
        let d = dispatcher();
        for op in OPERATIONS {
            let input: Map<String, Value> = op
                .required
                .iter()
                .map(|k| (k.to_string(), json!(0)))
                .collect();
            let output = d.dispatch(op.name, &input).unwrap();

            match op.output {
                Vector { key, len } => {
                    assert_eq!(
                        output[key].as_array().unwrap().len(),
                        len,
                        "operation {}",
                        op.name
                    );
                }
                Scalar { key } => {
                    assert!(output[key].is_number(), "operation {}", op.name);
                }
                Fields { keys, len } => {
                    for key in keys {
                        let field = &output[*key];
                        if let Some(n) = len {
                            assert_eq!(
                                field.as_array().unwrap().len(),
                                n,
                                "operation {} field {}",
                                op.name,
                                key
                            );
                        } else {
                            assert!(field.is_number(), "operation {} field {}", op.name, key);
                        }
                    }
                }
                Ack => {
                    assert_eq!(output["success"], Value::Bool(true), "operation {}", op.name);
                }
            }
        }
    }

    #[test]
    fn engine_domain_error_surfaces_in_response() {
        struct FailingEngine;
        impl ComputeEngine for FailingEngine {
            fn invoke(&self, _: &str, _: &Map<String, Value>) -> Result<Value, EngineError> {
                Err(EngineError::Domain("audiogram out of range".into()))
            }
        }

        let d = Dispatcher::new(Arc::new(FailingEngine));
        let request = RequestEnvelope {
            sequence_num: 2,
            function: "GetMLE".into(),
            input_parameters: params(&[
                ("aidType", json!(0)),
                ("direction", json!(0)),
                ("mic", json!(0)),
            ]),
        };
        let response = d.respond(&request);
        assert_eq!(response.ret, -1);
        assert!(response.output_parameters["error"]
            .as_str()
            .unwrap()
            .contains("audiogram out of range"));
    }
}
