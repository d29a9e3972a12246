//! Parameter space parsing and expansion
//!
//! A specification looks like `period:10,20,50;mode:fast,slow;use_filter:true,false`.
//! Values are typed at parse time (integer, float, boolean, then text) and the
//! Cartesian product is enumerated in declaration order, last parameter varying
//! fastest. The position in that enumeration is the combination index.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info};

use crate::error::{OptimizerError, OptimizerResult};
use crate::types::{Combination, ParamAssignment, ParamValue};

/// Default upper bound on the number of combinations a run may commit to
pub const DEFAULT_MAX_COMBINATIONS: usize = 10_000;

/// One named parameter and its candidate values, in declaration order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    pub values: Vec<ParamValue>,
}

/// Ordered set of parameters for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpace {
    params: Vec<ParameterDef>,
}

impl ParameterSpace {
    /// Parse a `name:v1,v2;name2:v1` specification
    pub fn parse(spec: &str) -> OptimizerResult<Self> {
        let mut params = Vec::new();
        let mut seen = HashSet::new();

        for block in spec.split(';') {
            let block = block.trim();
            if block.is_empty() {
                continue;
            }

            let (name, raw_values) = block.split_once(':').ok_or_else(|| {
                OptimizerError::ParameterParse(format!(
                    "block '{}' is missing ':' between name and values",
                    block
                ))
            })?;

            let name = name.trim();
            if name.is_empty() {
                return Err(OptimizerError::ParameterParse(format!(
                    "block '{}' has an empty parameter name",
                    block
                )));
            }
            if !seen.insert(name.to_string()) {
                return Err(OptimizerError::ParameterParse(format!(
                    "duplicate parameter name '{}'",
                    name
                )));
            }

            if raw_values.trim().is_empty() {
                return Err(OptimizerError::ParameterParse(format!(
                    "parameter '{}' has an empty value list",
                    name
                )));
            }

            let values = raw_values
                .split(',')
                .map(|raw| {
                    let raw = raw.trim();
                    if raw.is_empty() {
                        Err(OptimizerError::ParameterParse(format!(
                            "parameter '{}' contains an empty value",
                            name
                        )))
                    } else {
                        parse_value(name, raw)
                    }
                })
                .collect::<OptimizerResult<Vec<_>>>()?;

            params.push(ParameterDef {
                name: name.to_string(),
                values,
            });
        }

        if params.is_empty() {
            return Err(OptimizerError::ParameterParse(
                "specification declares no parameters".to_string(),
            ));
        }

        debug!("Parsed {} parameters", params.len());
        Ok(ParameterSpace { params })
    }

    pub fn params(&self) -> &[ParameterDef] {
        &self.params
    }

    /// Product of candidate counts, `None` on overflow
    pub fn total_combinations(&self) -> Option<u128> {
        self.params
            .iter()
            .try_fold(1u128, |acc, p| acc.checked_mul(p.values.len() as u128))
    }

    /// Materialize every combination, refusing before allocation if the count
    /// exceeds `ceiling`
    pub fn expand(&self, ceiling: usize) -> OptimizerResult<Vec<Combination>> {
        let total = match self.total_combinations() {
            Some(total) if total <= ceiling as u128 => total as usize,
            Some(total) => {
                return Err(OptimizerError::CombinationExplosion {
                    total: total.to_string(),
                    ceiling,
                })
            }
            None => {
                return Err(OptimizerError::CombinationExplosion {
                    total: "more than 2^128".to_string(),
                    ceiling,
                })
            }
        };

        let combinations: Vec<Combination> = self
            .params
            .iter()
            .map(|p| 0..p.values.len())
            .multi_cartesian_product()
            .enumerate()
            .map(|(index, picks)| Combination {
                index,
                values: self
                    .params
                    .iter()
                    .zip(picks)
                    .map(|(p, pick)| ParamAssignment {
                        name: p.name.clone(),
                        value: p.values[pick].clone(),
                    })
                    .collect(),
            })
            .collect();

        debug_assert_eq!(combinations.len(), total);
        info!(
            "Expanded {} parameters into {} combinations",
            self.params.len(),
            combinations.len()
        );
        Ok(combinations)
    }
}

/// Canonical `name:v1,v2;name2:v1` form
impl fmt::Display for ParameterSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let blocks: Vec<String> = self
            .params
            .iter()
            .map(|p| format!("{}:{}", p.name, p.values.iter().join(",")))
            .collect();
        f.write_str(&blocks.join(";"))
    }
}

/// Parse and expand in one step
pub fn expand_spec(
    spec: &str,
    ceiling: usize,
) -> OptimizerResult<(ParameterSpace, Vec<Combination>)> {
    let space = ParameterSpace::parse(spec)?;
    let combinations = space.expand(ceiling)?;
    Ok((space, combinations))
}

/// Narrowest type that accepts the literal. Numeric literals that do not fit
/// their type are rejected rather than kept as text.
fn parse_value(name: &str, raw: &str) -> OptimizerResult<ParamValue> {
    if is_integer_literal(raw) {
        return raw.parse::<i64>().map(ParamValue::Int).map_err(|_| {
            OptimizerError::ParameterParse(format!(
                "parameter '{}' value '{}' does not fit in a 64-bit integer",
                name, raw
            ))
        });
    }

    if raw.contains('.') && raw.chars().any(|c| c.is_ascii_digit()) {
        if let Ok(v) = raw.parse::<f64>() {
            if !v.is_finite() {
                return Err(OptimizerError::ParameterParse(format!(
                    "parameter '{}' value '{}' is out of floating-point range",
                    name, raw
                )));
            }
            return Ok(ParamValue::Float(v));
        }
    }

    match raw.to_ascii_lowercase().as_str() {
        "true" => return Ok(ParamValue::Bool(true)),
        "false" => return Ok(ParamValue::Bool(false)),
        _ => {}
    }

    Ok(ParamValue::Text(raw.to_string()))
}

fn is_integer_literal(raw: &str) -> bool {
    let digits = raw.strip_prefix(['+', '-']).unwrap_or(raw);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_is_product_of_candidates() {
        let space = ParameterSpace::parse("a:1,2,3;b:x,y").unwrap();
        assert_eq!(space.total_combinations(), Some(6));
        assert_eq!(space.expand(100).unwrap().len(), 6);
    }

    #[test]
    fn test_value_typing() {
        let space = ParameterSpace::parse("n:-3,+4;f:2.5,.5;b:true,False;s:fast,1e3").unwrap();
        let p = space.params();
        assert_eq!(p[0].values, vec![ParamValue::Int(-3), ParamValue::Int(4)]);
        assert_eq!(p[1].values, vec![ParamValue::Float(2.5), ParamValue::Float(0.5)]);
        assert_eq!(p[2].values, vec![ParamValue::Bool(true), ParamValue::Bool(false)]);
        assert_eq!(
            p[3].values,
            vec![
                ParamValue::Text("fast".to_string()),
                ParamValue::Text("1e3".to_string())
            ]
        );
    }

    #[test]
    fn test_enumeration_order_is_lexicographic() {
        let combos = ParameterSpace::parse("a:1,2;b:x,y").unwrap().expand(10).unwrap();
        let rendered: Vec<String> = combos.iter().map(|c| c.to_string()).collect();
        assert_eq!(rendered, vec!["a=1 b=x", "a=1 b=y", "a=2 b=x", "a=2 b=y"]);
        for (i, c) in combos.iter().enumerate() {
            assert_eq!(c.index, i);
        }
    }

    #[test]
    fn test_expansion_is_reproducible() {
        let spec = "fast:5,8,13;slow:21,34;mode:a,b,c";
        let first = ParameterSpace::parse(spec).unwrap().expand(1000).unwrap();
        let second = ParameterSpace::parse(spec).unwrap().expand(1000).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_malformed_specs() {
        for spec in ["", ";", ":1,2", "a:", "a:1,,2", "a:1;a:2", "novalues"] {
            assert!(
                matches!(
                    ParameterSpace::parse(spec),
                    Err(OptimizerError::ParameterParse(_))
                ),
                "spec {:?} should fail",
                spec
            );
        }
    }

    #[test]
    fn test_out_of_range_numbers_are_rejected() {
        let big = "period:10,99999999999999999999";
        match ParameterSpace::parse(big) {
            Err(OptimizerError::ParameterParse(msg)) => {
                assert!(msg.contains("99999999999999999999"), "{}", msg);
            }
            other => panic!("expected ParameterParse, got {:?}", other),
        }

        let huge_float = format!("x:1.5,{}.0", "9".repeat(400));
        assert!(matches!(
            ParameterSpace::parse(&huge_float),
            Err(OptimizerError::ParameterParse(_))
        ));

        // Still fits
        let max = ParameterSpace::parse("n:9223372036854775807").unwrap();
        assert_eq!(max.params()[0].values, vec![ParamValue::Int(i64::MAX)]);
    }

    #[test]
    fn test_explosion_fails_before_materializing() {
        let space = ParameterSpace::parse("a:1,2,3,4,5;b:1,2,3,4,5;c:1,2,3,4,5").unwrap();
        match space.expand(100) {
            Err(OptimizerError::CombinationExplosion { total, ceiling }) => {
                assert_eq!(total, "125");
                assert_eq!(ceiling, 100);
            }
            other => panic!("expected explosion, got {:?}", other),
        }
        assert_eq!(space.expand(125).unwrap().len(), 125);
    }

    #[test]
    fn test_display_is_canonical() {
        let space = ParameterSpace::parse(" a : 1, 2.5 ;b:x ;").unwrap();
        assert_eq!(space.to_string(), "a:1,2.5;b:x");
        assert_eq!(ParameterSpace::parse(&space.to_string()).unwrap(), space);
    }

    #[test]
    fn test_whitespace_and_trailing_separator() {
        let space = ParameterSpace::parse(" period : 10 , 20 ; ").unwrap();
        assert_eq!(space.params().len(), 1);
        assert_eq!(space.params()[0].name, "period");
        assert_eq!(
            space.params()[0].values,
            vec![ParamValue::Int(10), ParamValue::Int(20)]
        );
    }
}
