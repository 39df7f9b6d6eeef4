/*
 * Copyright© 2025 UT-Battelle, LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
/// Solver configuration: adapter level tolerances, a command line style
/// options database and the user override hooks.
use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use crate::error::{Result, SolverError};
use crate::nl_engine::NonlinearEngine;


/// Tolerances and limits held by the solver adapter and pushed to the engine
/// on every solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub max_nonlinear_iterations: usize,
    pub max_function_evaluations: usize,
    pub absolute_residual_tolerance: f64,
    pub relative_residual_tolerance: f64,
    pub relative_step_tolerance: f64,
    pub max_linear_iterations: usize,
    /// Relative tolerance of the first inner linear solve
    pub initial_linear_tolerance: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_nonlinear_iterations: 50,
            max_function_evaluations: 10000,
            absolute_residual_tolerance: 1e-50,
            relative_residual_tolerance: 1e-8,
            relative_step_tolerance: 1e-8,
            max_linear_iterations: 10000,
            initial_linear_tolerance: 1e-12,
        }
    }
}


/// Command line style option store.
///
/// Keys are stored without the leading dash.  Engines look options up under
/// their options prefix so several solvers in one process can be configured
/// independently: `-sys1_snes_max_it 3` only reaches the engine whose prefix
/// is `sys1_`.
#[derive(Clone, Debug, Default)]
pub struct OptionsDatabase {
    entries: BTreeMap<String, Option<String>>,
}

fn is_key(tok: &str) -> bool {
    let mut chars = tok.chars();
    chars.next() == Some('-')
        && chars.next().map_or(false, |c| c.is_ascii_alphabetic() || c == '-')
}

impl OptionsDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `-key value` / `-flag` tokens.  Tokens before the first key
    /// (the program name, positional args) are ignored.
    pub fn from_args<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut db = Self::new();
        let mut pending: Option<String> = None;
        for tok in args {
            let tok = tok.as_ref();
            if is_key(tok) {
                if let Some(key) = pending.take() {
                    db.entries.insert(key, None);
                }
                pending = Some(tok.trim_start_matches('-').to_string());
            } else if let Some(key) = pending.take() {
                db.entries.insert(key, Some(tok.to_string()));
            }
        }
        if let Some(key) = pending {
            db.entries.insert(key, None);
        }
        db
    }

    pub fn insert(&mut self, name: &str, value: Option<&str>) {
        self.entries.insert(
            name.trim_start_matches('-').to_string(),
            value.map(|v| v.to_string()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn full_name(prefix: Option<&str>, name: &str) -> String {
        format!("{}{}", prefix.unwrap_or(""), name)
    }

    pub fn has_name(&self, prefix: Option<&str>, name: &str) -> bool {
        self.entries.contains_key(&Self::full_name(prefix, name))
    }

    pub fn get_str(&self, prefix: Option<&str>, name: &str) -> Option<&str> {
        self.entries.get(&Self::full_name(prefix, name))
            .and_then(|v| v.as_deref())
    }

    fn parse<T: std::str::FromStr>(&self, prefix: Option<&str>, name: &str) -> Result<Option<T>> {
        let full = Self::full_name(prefix, name);
        match self.entries.get(&full) {
            None => Ok(None),
            Some(val) => {
                let raw = val.as_deref().unwrap_or("");
                raw.parse::<T>()
                    .map(Some)
                    .map_err(|_| SolverError::InvalidOption { name: full.clone(), value: raw.to_string() })
            }
        }
    }

    pub fn get_f64(&self, prefix: Option<&str>, name: &str) -> Result<Option<f64>> {
        self.parse::<f64>(prefix, name)
    }

    pub fn get_usize(&self, prefix: Option<&str>, name: &str) -> Result<Option<usize>> {
        self.parse::<usize>(prefix, name)
    }

    /// A bare flag reads as true
    pub fn get_bool(&self, prefix: Option<&str>, name: &str) -> Result<Option<bool>> {
        let full = Self::full_name(prefix, name);
        match self.entries.get(&full) {
            None => Ok(None),
            Some(None) => Ok(Some(true)),
            Some(Some(v)) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(SolverError::InvalidOption { name: full, value: v.clone() }),
            },
        }
    }
}


/// User override hooks for engine configuration.
///
/// `set_options_during_init` runs when the engine is created,
/// `configure_solver` runs last before each solve so anything it sets wins
/// over tolerances and the options database.
pub trait SolverConfiguration {
    fn set_options_during_init(&mut self, _engine: &mut dyn NonlinearEngine) -> Result<()> {
        Ok(())
    }

    fn configure_solver(&mut self, engine: &mut dyn NonlinearEngine) -> Result<()>;
}


#[cfg(test)]
mod test_options {
    use super::*;

    #[test]
    fn test_parse_args() {
        let db = OptionsDatabase::from_args(
            ["prog", "-snes_max_it", "7", "-snes_mf", "-sys1_ksp_rtol", "1e-3", "-snes_atol", "-1e-3"]);
        assert_eq!(db.len(), 4);
        assert_eq!(db.get_usize(None, "snes_max_it").unwrap(), Some(7));
        assert_eq!(db.get_bool(None, "snes_mf").unwrap(), Some(true));
        assert_eq!(db.get_f64(Some("sys1_"), "ksp_rtol").unwrap(), Some(1e-3));
        assert_eq!(db.get_f64(None, "ksp_rtol").unwrap(), None);
        assert_eq!(db.get_f64(None, "snes_atol").unwrap(), Some(-1e-3));
    }

    #[test]
    fn test_bad_value() {
        let mut db = OptionsDatabase::new();
        db.insert("-snes_max_it", Some("many"));
        assert!(matches!(
            db.get_usize(None, "snes_max_it"),
            Err(SolverError::InvalidOption { .. })));
        db.insert("snes_mf", Some("maybe"));
        assert!(db.get_bool(None, "snes_mf").is_err());
    }

    #[test]
    fn test_settings_from_json() {
        let s: SolverSettings = serde_json::from_str(
            r#"{"max_nonlinear_iterations": 12, "relative_residual_tolerance": 1e-10}"#).unwrap();
        assert_eq!(s.max_nonlinear_iterations, 12);
        assert_eq!(s.relative_residual_tolerance, 1e-10);
        assert_eq!(s.max_linear_iterations, SolverSettings::default().max_linear_iterations);
    }
}
