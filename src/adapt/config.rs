use crate::domain::mesh::{h_refinement::Regularity, MAX_POLYNOMIAL_ORDER};
use json::JsonValue;
use std::fs::read_to_string;
use std::str::FromStr;
use thiserror::Error;

/// How Elems are selected for refinement from their error indicators
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// refine the largest errors until a fraction `sqrt(THRESHOLD)` of the total error is covered
    Cumulative,
    /// refine every Elem whose error is at least `THRESHOLD` times the largest error
    RelativeToMax,
    /// refine every Elem whose (relative squared) error is at least `THRESHOLD`
    Absolute,
}

impl Strategy {
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Self::Cumulative),
            1 => Some(Self::RelativeToMax),
            2 => Some(Self::Absolute),
            _ => None,
        }
    }
}

/// The refinement candidates considered for each marked Elem
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandList {
    /// isotropic p-refinements
    PIso,
    /// isotropic and anisotropic p-refinements
    PAniso,
    /// isotropic h-refinement only (no candidate search)
    HIso,
    /// isotropic and anisotropic h-refinements keeping the current orders
    HAniso,
    /// isotropic p- and h-refinements
    HpIso,
    /// isotropic p-refinements, isotropic and anisotropic splits
    HpAnisoH,
    /// isotropic and anisotropic p-refinements, isotropic splits
    HpAnisoP,
    /// everything
    HpAniso,
}

impl CandList {
    pub fn has_p(&self) -> bool {
        !matches!(self, Self::HIso | Self::HAniso)
    }

    pub fn has_h(&self) -> bool {
        !matches!(self, Self::PIso | Self::PAniso)
    }

    /// p-candidates (and son orders) may differ per direction
    pub fn has_aniso_p(&self) -> bool {
        matches!(self, Self::PAniso | Self::HpAnisoP | Self::HpAniso)
    }

    /// quads may be split with `U` and `V`
    pub fn has_aniso_h(&self) -> bool {
        matches!(self, Self::HAniso | Self::HpAnisoH | Self::HpAniso)
    }

    /// h-candidates search over the orders of their sons
    pub fn has_son_orders(&self) -> bool {
        self.has_p() && self.has_h()
    }
}

impl FromStr for CandList {
    type Err = ConfigError;

    /// Case insensitive; underscores and an `H2D_` prefix are ignored (`"hp_aniso_h"`, `"H2D_HP_ANISO_H"`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s.to_uppercase().chars().filter(|c| *c != '_').collect();
        let normalized = normalized.strip_prefix("H2D").unwrap_or(&normalized);

        match normalized {
            "PISO" => Ok(Self::PIso),
            "PANISO" => Ok(Self::PAniso),
            "HISO" => Ok(Self::HIso),
            "HANISO" => Ok(Self::HAniso),
            "HPISO" => Ok(Self::HpIso),
            "HPANISOH" => Ok(Self::HpAnisoH),
            "HPANISOP" => Ok(Self::HpAnisoP),
            "HPANISO" => Ok(Self::HpAniso),
            _ => Err(ConfigError::InvalidValue {
                key: "CAND_LIST",
                reason: format!("unknown candidate list '{}'", s),
            }),
        }
    }
}

/// How the coarse solution of each step is obtained
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoarseSolution {
    /// solve the problem on the coarse Space
    Solve,
    /// project the reference solution onto the coarse Space
    Project,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read adaptivity parameters: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to parse adaptivity parameters: {0}")]
    Parse(String),
    #[error("Invalid value for {key} ({reason}); Cannot configure adaptivity!")]
    InvalidValue { key: &'static str, reason: String },
    #[error("No Spaces were given; Cannot adapt!")]
    NoComponents,
    #[error("Expected {expected} {what} (one per Space) but found {found}; Cannot adapt!")]
    ComponentMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
}

impl ConfigError {
    /// Check that a per-component list matches the number of Spaces
    pub(crate) fn check_components(what: &'static str, expected: usize, found: usize) -> Result<(), Self> {
        if expected == 0 {
            Err(Self::NoComponents)
        } else if expected != found {
            Err(Self::ComponentMismatch { what, expected, found })
        } else {
            Ok(())
        }
    }
}

/// Parameters of the [AdaptivityLoop](super::AdaptivityLoop)
#[derive(Clone, Debug, PartialEq)]
pub struct AdaptConfig {
    /// marking threshold (meaning depends on the [Strategy])
    pub threshold: f64,
    pub strategy: Strategy,
    pub cand_list: CandList,
    /// disallow anisotropic candidates even if the [CandList] has them
    pub iso_only: bool,
    pub regularity: Regularity,
    /// exponent of the DoF increase in candidate scores
    pub conv_exp: f64,
    /// stop once the estimated relative error (in percent) falls below this value
    pub err_stop: f64,
    /// stop once the coarse Space has at least this many DoFs
    pub ndof_stop: usize,
    /// order increase of the reference Space
    pub order_increase: u8,
    pub coarse_solution: CoarseSolution,
}

impl Default for AdaptConfig {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            strategy: Strategy::Cumulative,
            cand_list: CandList::HpAniso,
            iso_only: false,
            regularity: Regularity::Arbitrary,
            conv_exp: 1.0,
            err_stop: 1.0,
            ndof_stop: 60000,
            order_increase: 1,
            coarse_solution: CoarseSolution::Solve,
        }
    }
}

impl AdaptConfig {
    /// Read parameters from a JSON file (see [AdaptConfig::from_json_str])
    pub fn from_file(path: impl AsRef<str>) -> Result<Self, ConfigError> {
        let contents = read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Read parameters from a JSON object. Missing keys keep their default values.
    ///
    /// ```JSON
    /// {
    ///     "THRESHOLD": 0.3,
    ///     "STRATEGY": 0,
    ///     "CAND_LIST": "HP_ANISO",
    ///     "ISO_ONLY": false,
    ///     "MESH_REGULARITY": -1,
    ///     "CONV_EXP": 1.0,
    ///     "ERR_STOP": 1.0,
    ///     "NDOF_STOP": 60000,
    ///     "ORDER_INCREASE": 1,
    ///     "COARSE_SOLUTION": "solve"
    /// }
    /// ```
    ///
    /// The legacy key `ADAPT_TYPE` (`0` hp, `1` h, `2` p) selects a candidate list when `CAND_LIST` is absent.
    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        let params = json::parse(contents).map_err(|err| ConfigError::Parse(err.to_string()))?;
        if !params.is_object() {
            return Err(ConfigError::Parse(String::from("expected a JSON object")));
        }

        let mut config = Self::default();

        if let Some(threshold) = read_f64(&params, "THRESHOLD")? {
            config.threshold = threshold;
        }
        if let Some(strategy) = read_i64(&params, "STRATEGY")? {
            config.strategy = Strategy::from_index(strategy).ok_or_else(|| ConfigError::InvalidValue {
                key: "STRATEGY",
                reason: format!("expected 0, 1 or 2; found {}", strategy),
            })?;
        }
        if let Some(iso_only) = read_bool(&params, "ISO_ONLY")? {
            config.iso_only = iso_only;
        }
        match (&params["CAND_LIST"], read_i64(&params, "ADAPT_TYPE")?) {
            (JsonValue::Null, None) => (),
            (JsonValue::Null, Some(adapt_type)) => {
                config.cand_list = match (adapt_type, config.iso_only) {
                    (0, _) => CandList::HpAniso,
                    (1, true) => CandList::HIso,
                    (1, false) => CandList::HAniso,
                    (2, true) => CandList::PIso,
                    (2, false) => CandList::PAniso,
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            key: "ADAPT_TYPE",
                            reason: format!("expected 0, 1 or 2; found {}", adapt_type),
                        })
                    }
                }
            }
            (cand_list, _) => {
                config.cand_list = cand_list
                    .as_str()
                    .ok_or_else(|| invalid_type("CAND_LIST", "string"))?
                    .parse()?
            }
        }
        if let Some(level) = read_i64(&params, "MESH_REGULARITY")? {
            if level == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "MESH_REGULARITY",
                    reason: String::from("regular meshes are not supported; use -1 or a positive level"),
                });
            }
            config.regularity = Regularity::from_level(level.clamp(i32::MIN as i64, i32::MAX as i64) as i32);
        }
        if let Some(conv_exp) = read_f64(&params, "CONV_EXP")? {
            config.conv_exp = conv_exp;
        }
        if let Some(err_stop) = read_f64(&params, "ERR_STOP")? {
            config.err_stop = err_stop;
        }
        if let Some(ndof_stop) = read_i64(&params, "NDOF_STOP")? {
            config.ndof_stop = usize::try_from(ndof_stop).map_err(|_| ConfigError::InvalidValue {
                key: "NDOF_STOP",
                reason: format!("expected a non-negative integer; found {}", ndof_stop),
            })?;
        }
        if let Some(order_increase) = read_i64(&params, "ORDER_INCREASE")? {
            config.order_increase = u8::try_from(order_increase).map_err(|_| ConfigError::InvalidValue {
                key: "ORDER_INCREASE",
                reason: format!("expected a small non-negative integer; found {}", order_increase),
            })?;
        }
        match &params["COARSE_SOLUTION"] {
            JsonValue::Null => (),
            value => {
                config.coarse_solution = match value
                    .as_str()
                    .ok_or_else(|| invalid_type("COARSE_SOLUTION", "string"))?
                    .to_lowercase()
                    .as_str()
                {
                    "solve" => CoarseSolution::Solve,
                    "project" => CoarseSolution::Project,
                    other => {
                        return Err(ConfigError::InvalidValue {
                            key: "COARSE_SOLUTION",
                            reason: format!("expected 'solve' or 'project'; found '{}'", other),
                        })
                    }
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that every parameter is in range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(ConfigError::InvalidValue {
                key: "THRESHOLD",
                reason: format!("expected a value in (0, 1]; found {}", self.threshold),
            });
        }
        if !(self.conv_exp.is_finite() && self.conv_exp > 0.0) {
            return Err(ConfigError::InvalidValue {
                key: "CONV_EXP",
                reason: format!("expected a positive value; found {}", self.conv_exp),
            });
        }
        if !(self.err_stop >= 0.0) {
            return Err(ConfigError::InvalidValue {
                key: "ERR_STOP",
                reason: format!("expected a non-negative percentage; found {}", self.err_stop),
            });
        }
        if self.order_increase > MAX_POLYNOMIAL_ORDER {
            return Err(ConfigError::InvalidValue {
                key: "ORDER_INCREASE",
                reason: format!("must not exceed {}", MAX_POLYNOMIAL_ORDER),
            });
        }
        if let Regularity::MaxLevel(0) = self.regularity {
            return Err(ConfigError::InvalidValue {
                key: "MESH_REGULARITY",
                reason: String::from("regular meshes are not supported"),
            });
        }
        Ok(())
    }
}

fn invalid_type(key: &'static str, expected: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        reason: format!("expected a {}", expected),
    }
}

fn read_f64(params: &JsonValue, key: &'static str) -> Result<Option<f64>, ConfigError> {
    match &params[key] {
        JsonValue::Null => Ok(None),
        value => value.as_f64().map(Some).ok_or_else(|| invalid_type(key, "number")),
    }
}

fn read_i64(params: &JsonValue, key: &'static str) -> Result<Option<i64>, ConfigError> {
    match &params[key] {
        JsonValue::Null => Ok(None),
        value => value.as_i64().map(Some).ok_or_else(|| invalid_type(key, "integer")),
    }
}

fn read_bool(params: &JsonValue, key: &'static str) -> Result<Option<bool>, ConfigError> {
    match &params[key] {
        JsonValue::Null => Ok(None),
        value => value.as_bool().map(Some).ok_or_else(|| invalid_type(key, "boolean")),
    }
}
