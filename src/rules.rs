use crate::error::Error;
use crate::mapping::{Classification, MappingContext, Rule, RuleModule};
use crate::table::Record;
use serde_json::Value;

fn text<'a>(e: &'a Record, field: &str) -> Option<&'a str> {
    e.get(field).and_then(Value::as_str)
}

fn is_blank(e: &Record, field: &str) -> bool {
    match e.get(field) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

// feature

fn search(e: &Record, _: &MappingContext<'_>) -> Classification {
    let method = text(e, "method");
    if matches!(method, Some("type_query") | Some("select_query"))
        && text(e, "object") == Some("search_bar")
        && is_blank(e, "value")
    {
        Classification::Label("search".to_string())
    } else {
        Classification::NoMatch
    }
}

fn coupon(e: &Record, _: &MappingContext<'_>) -> Classification {
    if text(e, "method") != Some("click") || text(e, "object") != Some("coupon") {
        return Classification::NoMatch;
    }
    let mut labels = vec!["feature: coupon".to_string()];
    if let Some(source) = text(e, "value").filter(|v| !v.is_empty()) {
        labels.push(format!("source: {}", source));
        labels.push("partner: true".to_string());
    }
    Classification::Labels(labels)
}

fn travel(e: &Record, _: &MappingContext<'_>) -> Classification {
    if text(e, "object") == Some("travel_search") {
        Classification::Labels(vec!["feature: travel".to_string()])
    } else {
        Classification::NoMatch
    }
}

pub static FEATURE: RuleModule = RuleModule {
    name: "feature",
    entries: &[
        (&["Feature"], Rule { name: "search", apply: search }),
        (&["Vertical", "ShoppingVertical"], Rule { name: "coupon", apply: coupon }),
        (&["Vertical", "TravelVertical"], Rule { name: "travel", apply: travel }),
    ],
};

// channel

const TRACKER_TOKEN_COLUMNS: [&str; 3] = ["adgroup_token", "campaign_token", "network_token"];

/// Resolves the record's tracker token against the tracker tree handed in
/// as lookup table, most specific level first.
fn network(e: &Record, ctx: &MappingContext<'_>) -> Classification {
    let (Some(token), Some(trackers)) = (text(e, "tracker_token"), ctx.lookup) else {
        return Classification::NoMatch;
    };
    for column in TRACKER_TOKEN_COLUMNS {
        let found = trackers
            .rows()
            .iter()
            .find(|t| t.get(column).and_then(Value::as_str) == Some(token));
        if let Some(name) = found.and_then(|t| text(t, "network_name")) {
            return Classification::Label(name.to_string());
        }
    }
    Classification::NoMatch
}

fn organic(e: &Record, _: &MappingContext<'_>) -> Classification {
    if is_blank(e, "tracker_token") {
        Classification::Label("Organic".to_string())
    } else {
        Classification::NoMatch
    }
}

pub static CHANNEL: RuleModule = RuleModule {
    name: "channel",
    entries: &[
        (&["Network"], Rule { name: "network", apply: network }),
        (&["Network"], Rule { name: "organic", apply: organic }),
    ],
};

static MODULES: [&RuleModule; 2] = [&FEATURE, &CHANNEL];

/// Looks up a registered rule module by name.
pub fn module(name: &str) -> Result<&'static RuleModule, Error> {
    MODULES
        .iter()
        .copied()
        .find(|m| m.name == name)
        .ok_or_else(|| Error::config(format!("unknown mapping '{}'", name)))
}
