use super::{conform, data_check, to_float};
use crate::countries::alpha2;
use crate::error::Error;
use crate::table::{Extracted, Record, Table};
use crate::task::{Registry, SourceTransform, TransformInput};
use async_trait::async_trait;
use log::info;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const FB_INDEX: &str = "fb_index";
const FB_INDEX_LATEST: &str = "fb_index_latest";
const CB_INDEX: &str = "cb_index";
const PACKAGE: &str = "global_package";

/// Index tables and the priced output must cover more countries than this.
const MIN_COUNTRIES: usize = 200;

// 2017 mobile market share
const ANDROID_SHARE: f64 = 72.63;
const IOS_SHARE: f64 = 19.65;

pub(super) fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.insert(
        "google_search_rps".to_string(),
        Arc::new(GoogleSearchRps {
            min_countries: MIN_COUNTRIES,
        }) as Arc<dyn SourceTransform>,
    );
    registry
}

fn text<'r>(row: &'r Record, column: &str) -> Option<&'r str> {
    row.get(column).and_then(Value::as_str)
}

fn number(row: &Record, column: &str) -> Option<f64> {
    match to_float(row.get(column)?) {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Revenue per search by country.
///
/// A single factor spreads the global package over countries in proportion
/// to search volume times cost index:
/// `factor = package / Σ(volume × base cost index)`, and a country's rps is
/// its latest cost index times that factor. The Facebook cost index is the
/// reference since it covers every vertical; the Chartboost mobile index is
/// priced the same way for comparison only.
struct GoogleSearchRps {
    min_countries: usize,
}

impl GoogleSearchRps {
    /// Cost index by alpha-2 country of one vertical, first row per country
    /// winning. A null index stays null.
    fn fb_vertical(&self, name: &str, table: &Table) -> Result<HashMap<String, Option<f64>>, Error> {
        if table.len() <= self.min_countries {
            return Err(data_check(
                name,
                format!("too few rows in fb index: {}", table.len()),
            ));
        }
        let mut index = HashMap::new();
        for row in table.rows() {
            if let Some(country) = text(row, "country_code").and_then(alpha2) {
                index
                    .entry(country.to_string())
                    .or_insert_with(|| number(row, "cost_index"));
            }
        }
        Ok(index)
    }

    /// Mean cost index over every vertical. Countries missing from any
    /// vertical are left out.
    fn fb_average(&self, input: &TransformInput<'_>, name: &str) -> Result<HashMap<String, f64>, Error> {
        let tables: Vec<&Table> = match input.extracted.get(name) {
            Some(Extracted::Iterated(verticals)) => verticals.values().collect(),
            Some(Extracted::Table(table)) => vec![table],
            None => {
                return Err(Error::config(format!(
                    "source '{}' needs '{}' extracted in the same run",
                    input.source, name
                )))
            }
        };
        let verticals = tables
            .into_iter()
            .map(|t| self.fb_vertical(name, t))
            .collect::<Result<Vec<_>, _>>()?;
        let Some((first, rest)) = verticals.split_first() else {
            return Err(data_check(name, "no fb index extracted".to_string()));
        };

        Ok(first
            .iter()
            .filter_map(|(country, cost)| {
                let mut total = (*cost)?;
                for vertical in rest {
                    total += vertical.get(country).copied().flatten()?;
                }
                Some((country.clone(), total / verticals.len() as f64))
            })
            .collect())
    }
}

/// Market-share weighted mobile install cost by country. Countries need a
/// positive average on both platforms.
fn cb_index(table: &Table) -> HashMap<String, f64> {
    let mobile_base = ANDROID_SHARE + IOS_SHARE;
    let platform = |name: &str, share: f64| -> HashMap<String, f64> {
        table
            .rows()
            .iter()
            .filter(|r| text(r, "platform") == Some(name) && text(r, "category") == Some("Average"))
            .filter_map(|r| {
                let cpi = number(r, "cpi").filter(|c| *c > 0.0)?;
                Some((text(r, "country_code")?.to_string(), cpi / mobile_base * share))
            })
            .collect()
    };
    let ios = platform("iOS", IOS_SHARE);

    platform("Google Play", ANDROID_SHARE)
        .into_iter()
        .filter_map(|(country, android)| {
            let cpi = android + ios.get(&country)?;
            (cpi > 0.0).then_some((country, cpi))
        })
        .collect()
}

fn is_country_code(code: &str) -> bool {
    code.len() == 2 && code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

struct Priced {
    country: String,
    volume: f64,
    base: f64,
    latest: Option<f64>,
    cb: Option<f64>,
}

#[async_trait]
impl SourceTransform for GoogleSearchRps {
    fn inputs(&self, source: &str) -> Vec<String> {
        [source, FB_INDEX, FB_INDEX_LATEST, CB_INDEX, PACKAGE]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    async fn transform(&self, input: &TransformInput<'_>) -> Result<Table, Error> {
        let package = input
            .table(PACKAGE)?
            .rows()
            .first()
            .and_then(|row| number(row, "package"))
            .ok_or_else(|| data_check(PACKAGE, "package is missing".to_string()))?;
        let base = self.fb_average(input, FB_INDEX)?;
        let latest = self.fb_average(input, FB_INDEX_LATEST)?;
        let cb = cb_index(&input.table(CB_INDEX)?);

        // search volume per country, in country order
        let mut volumes: BTreeMap<String, f64> = BTreeMap::new();
        for row in input.table(input.source)?.rows() {
            if let Some(country) = text(row, "country") {
                *volumes.entry(country.to_string()).or_default() += number(row, "volume").unwrap_or(0.0);
            }
        }

        let priced: Vec<Priced> = volumes
            .into_iter()
            .filter(|(country, volume)| is_country_code(country) && *volume > 0.0)
            .filter_map(|(country, volume)| {
                let base = base.get(&country).copied().filter(|b| *b > 0.0)?;
                Some(Priced {
                    latest: latest.get(&country).copied(),
                    cb: cb.get(&country).copied(),
                    country,
                    volume,
                    base,
                })
            })
            .collect();

        let rps_factor = package / priced.iter().map(|p| p.volume * p.base).sum::<f64>();
        info!("Facebook RPS factor: {}", rps_factor);
        let cb_weight: f64 = priced.iter().filter_map(|p| Some(p.volume * p.cb?)).sum();
        let cb_rps_factor = (cb_weight > 0.0).then(|| package / cb_weight);
        info!("Chartboost RPS factor: {:?}", cb_rps_factor);

        if priced.len() <= self.min_countries {
            return Err(data_check(
                input.source,
                format!("too few rows in transformed data: {}", priced.len()),
            ));
        }
        if let Some(p) = priced.iter().find(|p| p.latest.is_none()) {
            return Err(data_check(
                input.source,
                format!("null value in cost_idx_latest for {}", p.country),
            ));
        }

        Ok(priced
            .iter()
            .map(|p| {
                let rps = p.latest.map(|l| l * rps_factor);
                let rps_cb = p.cb.zip(cb_rps_factor).map(|(c, f)| c * f);
                let ratio = match (rps_cb, rps) {
                    (Some(cb), Some(rps)) if rps != 0.0 => Some(cb / rps),
                    _ => None,
                };
                let row = json!({
                    "country": p.country,
                    "volume": p.volume.round() as i64,
                    "cost_idx_base": p.base,
                    "cost_idx_latest": p.latest,
                    "cost_idx_cb": p.cb,
                    "rps": rps,
                    "rps_cb": rps_cb,
                    "cb_rps_ratio": ratio,
                });
                match row {
                    Value::Object(record) => conform(input.schema, &record),
                    _ => Record::new(),
                }
            })
            .collect())
    }
}
