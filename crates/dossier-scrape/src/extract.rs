//! Inventory extraction: JSON-LD first, then card heuristics from the rule table, then a
//! normalizer that maps raw fields onto `VehicleRecord`.

use std::collections::HashSet;

use dossier_core::{Condition, VehicleRecord, VehicleType};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    compile_selector, element_text, select_all_texts, select_first_attr, select_first_text,
    text_or_none, PageKind, PageSnapshot, RuleError, SiteSnapshot,
};

static VIN_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bVIN\s*[:#]?\s*([A-HJ-NPR-Z0-9]{17})\b").expect("valid vin label regex")
});
static VIN_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-HJ-NPR-Z0-9]{17})\b").expect("valid vin regex"));
static STOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bstock\s*(?:#|no\.?|number)?\s*:?\s*#?\s*([A-Z0-9][A-Z0-9-]{2,})\b")
        .expect("valid stock regex")
});
static MILEAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{1,3}(?:,\d{3})+|\d{1,7})\s*(?:mi|miles)\b").expect("valid mileage regex")
});
static YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(19[89]\d|20\d{2})\b").expect("valid year regex"));
static TITLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:(certified pre-owned|certified|pre-owned|used|new|cpo)\s+)?((?:19|20)\d{2})\s+(\S+)\s+(\S+)(?:\s+(.+?))?\s*$",
    )
    .expect("valid title regex")
});
static PRICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\s?(\d{1,3}(?:,\d{3})+|\d+)(\.\d{1,2})?").expect("valid price regex"));
static MONTHLY_TAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*\*?\s*(?:/\s*mo|per\s+mo|a\s+month|mo\b|monthly|/\s*month)")
        .expect("valid monthly regex")
});
static CPO_BADGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:certified pre-owned|cpo)\b").expect("valid cpo regex"));
static WORD_NEW: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bnew\b").expect("valid new regex"));
static WORD_CPO: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bcpo\b").expect("valid cpo regex"));
static URL_NEW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[/\-_?=&.])new(?:[/\-_?=&.]|$)").expect("valid new url regex"));

fn default_link() -> String {
    "a[href]".to_string()
}

#[derive(Debug, Deserialize)]
struct InventoryRulesDoc {
    strategies: Vec<StrategyDoc>,
    #[serde(default)]
    body_styles: BodyTableDoc,
    #[serde(default)]
    model_hints: BodyTableDoc,
    #[serde(default)]
    unknown_values: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BodyTableDoc {
    truck: Vec<String>,
    suv: Vec<String>,
    sedan: Vec<String>,
}

impl BodyTableDoc {
    fn into_table(self) -> Vec<(VehicleType, Vec<String>)> {
        let lower = |words: Vec<String>| words.into_iter().map(|w| w.to_lowercase()).collect();
        vec![
            (VehicleType::Truck, lower(self.truck)),
            (VehicleType::Suv, lower(self.suv)),
            (VehicleType::Sedan, lower(self.sedan)),
        ]
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct AttributeNames {
    vin: Vec<String>,
    stock: Vec<String>,
    year: Vec<String>,
    make: Vec<String>,
    model: Vec<String>,
    trim: Vec<String>,
    price: Vec<String>,
    condition: Vec<String>,
    body: Vec<String>,
    mileage: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StrategyDoc {
    DataAttributes {
        card: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default = "default_link")]
        link: String,
        attributes: AttributeNames,
    },
    CardText {
        card: String,
        title: String,
        price: String,
        #[serde(default)]
        body: Option<String>,
        #[serde(default = "default_link")]
        link: String,
    },
}

#[derive(Debug, Clone)]
enum Strategy {
    DataAttributes {
        card: Selector,
        title: Option<Selector>,
        link: Selector,
        attributes: AttributeNames,
    },
    CardText {
        card: Selector,
        title: Selector,
        price: Selector,
        body: Option<Selector>,
        link: Selector,
    },
}

impl Strategy {
    fn name(&self) -> &'static str {
        match self {
            Self::DataAttributes { .. } => "data_attributes",
            Self::CardText { .. } => "card_text",
        }
    }

    fn compile(doc: StrategyDoc) -> Result<Self, RuleError> {
        Ok(match doc {
            StrategyDoc::DataAttributes {
                card,
                title,
                link,
                attributes,
            } => Self::DataAttributes {
                card: compile_selector("data_attributes.card", &card)?,
                title: title
                    .map(|css| compile_selector("data_attributes.title", &css))
                    .transpose()?,
                link: compile_selector("data_attributes.link", &link)?,
                attributes,
            },
            StrategyDoc::CardText {
                card,
                title,
                price,
                body,
                link,
            } => Self::CardText {
                card: compile_selector("card_text.card", &card)?,
                title: compile_selector("card_text.title", &title)?,
                price: compile_selector("card_text.price", &price)?,
                body: body
                    .map(|css| compile_selector("card_text.body", &css))
                    .transpose()?,
                link: compile_selector("card_text.link", &link)?,
            },
        })
    }

    fn collect(&self, document: &Html, base: Option<&Url>) -> Vec<RawVehicle> {
        match self {
            Self::DataAttributes {
                card,
                title,
                link,
                attributes,
            } => document
                .select(card)
                .map(|el| {
                    let attr = |names: &[String]| {
                        names
                            .iter()
                            .find_map(|n| el.value().attr(n.as_str()))
                            .and_then(|v| text_or_none(v.to_string()))
                    };
                    let text = element_text(el).unwrap_or_default();
                    RawVehicle {
                        vin: attr(&attributes.vin),
                        stock: attr(&attributes.stock),
                        year: attr(&attributes.year),
                        make: attr(&attributes.make),
                        model: attr(&attributes.model),
                        trim: attr(&attributes.trim),
                        title: title.as_ref().and_then(|s| select_first_text(el, s)),
                        condition: attr(&attributes.condition),
                        body: attr(&attributes.body),
                        price: attr(&attributes.price).or_else(|| text_or_none(text.clone())),
                        price_value: None,
                        mileage: attr(&attributes.mileage),
                        url: card_link(el, link, base),
                        badge_cpo: CPO_BADGE.is_match(&text),
                    }
                })
                .collect(),
            Self::CardText {
                card,
                title,
                price,
                body,
                link,
            } => document
                .select(card)
                .map(|el| {
                    let text = element_text(el).unwrap_or_default();
                    let prices = select_all_texts(el, price);
                    let vin = VIN_LABEL
                        .captures(&text)
                        .or_else(|| VIN_TOKEN.captures(&text))
                        .and_then(|c| c.get(1))
                        .map(|m| m.as_str().to_string());
                    RawVehicle {
                        vin,
                        stock: capture(&STOCK, &text),
                        title: select_first_text(el, title),
                        body: body.as_ref().and_then(|s| select_first_text(el, s)),
                        price: if prices.is_empty() {
                            text_or_none(text.clone())
                        } else {
                            Some(prices.join(" "))
                        },
                        mileage: capture(&MILEAGE, &text),
                        url: card_link(el, link, base),
                        badge_cpo: CPO_BADGE.is_match(&text),
                        ..RawVehicle::default()
                    }
                })
                .collect(),
        }
    }
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn card_link(el: ElementRef<'_>, link: &Selector, base: Option<&Url>) -> Option<String> {
    let href = select_first_attr(el, link, "href")?;
    match base {
        Some(base) => base.join(&href).ok().map(|u| u.to_string()),
        None => Some(href),
    }
}

/// Compiled heuristics and normalization tables.
#[derive(Debug, Clone)]
pub struct InventoryRules {
    strategies: Vec<Strategy>,
    body_styles: Vec<(VehicleType, Vec<String>)>,
    model_hints: Vec<(VehicleType, Vec<String>)>,
    unknown_values: HashSet<String>,
}

impl InventoryRules {
    pub fn from_yaml_str(raw: &str) -> Result<Self, RuleError> {
        let doc: InventoryRulesDoc = serde_yaml::from_str(raw)?;
        Ok(Self {
            strategies: doc
                .strategies
                .into_iter()
                .map(Strategy::compile)
                .collect::<Result<_, _>>()?,
            body_styles: doc.body_styles.into_table(),
            model_hints: doc.model_hints.into_table(),
            unknown_values: doc
                .unknown_values
                .into_iter()
                .map(|v| v.trim().to_lowercase())
                .collect(),
        })
    }

    pub fn strategy_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.strategies.iter().map(Strategy::name)
    }

    /// Trimmed value, or `None` for blanks and unknown tokens.
    fn known(&self, value: Option<String>) -> Option<String> {
        let value = text_or_none(value?)?;
        if self.unknown_values.contains(&value.to_lowercase()) {
            None
        } else {
            Some(value)
        }
    }

    /// Body style keywords, then model-name hints (matched against "model trim"), then
    /// body keywords in the title.
    pub fn classify_type(
        &self,
        body: Option<&str>,
        model: Option<&str>,
        trim: Option<&str>,
        title: Option<&str>,
    ) -> VehicleType {
        if let Some(found) = body.and_then(|b| keyword_type(&self.body_styles, b)) {
            return found;
        }
        if let Some(model) = model {
            let model = match trim {
                Some(trim) => format!("{model} {trim}").to_lowercase(),
                None => model.to_lowercase(),
            };
            for (vehicle_type, hints) in &self.model_hints {
                if hints
                    .iter()
                    .any(|h| model == *h || model.starts_with(&format!("{h} ")))
                {
                    return *vehicle_type;
                }
            }
        }
        title
            .and_then(|t| keyword_type(&self.body_styles, t))
            .unwrap_or(VehicleType::Other)
    }
}

fn keyword_type(table: &[(VehicleType, Vec<String>)], text: &str) -> Option<VehicleType> {
    let text = text.to_lowercase();
    table
        .iter()
        .find(|(_, words)| words.iter().any(|w| text.contains(w.as_str())))
        .map(|(t, _)| *t)
}

#[derive(Debug, Clone, Default)]
struct RawVehicle {
    vin: Option<String>,
    stock: Option<String>,
    year: Option<String>,
    make: Option<String>,
    model: Option<String>,
    trim: Option<String>,
    title: Option<String>,
    condition: Option<String>,
    body: Option<String>,
    price: Option<String>,
    price_value: Option<f64>,
    mileage: Option<String>,
    url: Option<String>,
    badge_cpo: bool,
}

#[derive(Debug, Default)]
struct TitleParts {
    condition: Option<String>,
    year: Option<String>,
    make: Option<String>,
    model: Option<String>,
    trim: Option<String>,
}

fn parse_title(title: &str) -> TitleParts {
    let Some(caps) = TITLE.captures(title) else {
        return TitleParts::default();
    };
    let group = |i: usize| caps.get(i).map(|m| m.as_str().trim().to_string());
    TitleParts {
        condition: group(1),
        year: group(2),
        make: group(3),
        model: group(4),
        trim: group(5).filter(|t| !t.is_empty()),
    }
}

#[derive(Debug, Clone)]
pub struct InventoryExtractor {
    rules: InventoryRules,
}

impl InventoryExtractor {
    pub fn new(rules: InventoryRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &InventoryRules {
        &self.rules
    }

    /// Listing pages in capture order, or the homepage when no listing page was found.
    /// Duplicates by identity key keep their first occurrence.
    pub fn extract(&self, snapshot: &SiteSnapshot) -> Vec<VehicleRecord> {
        let mut pages = snapshot.pages_of(PageKind::Listing).collect::<Vec<_>>();
        if pages.is_empty() {
            pages = snapshot.pages_of(PageKind::Home).collect();
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for page in pages {
            for record in self.page_records(page) {
                if seen.insert(record.identity_key.clone()) {
                    out.push(record);
                }
            }
        }
        out
    }

    fn page_records(&self, page: &PageSnapshot) -> Vec<VehicleRecord> {
        let hint = condition_hint(&page.url);
        let mut raws = json_ld_vehicles(&page.structured);
        let mut layer = "json_ld";
        if raws.is_empty() {
            let (strategy, found) = self.heuristic_vehicles(page);
            layer = strategy;
            raws = found;
        }
        let found = raws.len();
        let records = raws
            .into_iter()
            .filter_map(|raw| self.normalize(raw, hint))
            .collect::<Vec<_>>();
        debug!(
            url = %page.url,
            layer,
            found,
            kept = records.len(),
            "inventory page extracted"
        );
        records
    }

    fn heuristic_vehicles(&self, page: &PageSnapshot) -> (&'static str, Vec<RawVehicle>) {
        let document = Html::parse_document(&page.html);
        let base = page.parsed_url();
        for strategy in &self.rules.strategies {
            let found = strategy.collect(&document, base.as_ref());
            if !found.is_empty() {
                return (strategy.name(), found);
            }
        }
        ("none", Vec::new())
    }

    fn normalize(&self, raw: RawVehicle, hint: Option<Condition>) -> Option<VehicleRecord> {
        let rules = &self.rules;
        let title = rules.known(raw.title);
        let parts = title.as_deref().map(parse_title).unwrap_or_default();

        let vin = rules.known(raw.vin).and_then(|v| normalize_vin(&v));
        let stock = rules
            .known(raw.stock)
            .map(|s| s.trim_start_matches('#').trim().to_string())
            .filter(|s| !s.is_empty() && s.chars().any(|c| c.is_ascii_digit()));
        let year = rules
            .known(raw.year)
            .or(parts.year)
            .and_then(|y| parse_year(&y));
        let raw_model = rules.known(raw.model);
        let trim = match &raw_model {
            Some(_) => rules.known(raw.trim),
            None => rules.known(raw.trim).or(parts.trim),
        };
        let make = rules.known(raw.make).or(parts.make);
        let model = raw_model.or(parts.model);

        let condition = [
            rules.known(raw.condition).and_then(|c| normalize_condition(&c)),
            parts.condition.and_then(|c| normalize_condition(&c)),
            raw.badge_cpo.then_some(Condition::Cpo),
        ]
        .into_iter()
        .flatten()
        .max()
        .or(hint);

        let body = rules.known(raw.body);
        let vehicle_type = rules.classify_type(
            body.as_deref(),
            model.as_deref(),
            trim.as_deref(),
            title.as_deref(),
        );

        let price = raw
            .price_value
            .or_else(|| rules.known(raw.price).and_then(|p| parse_price(&p)))
            .filter(|p| p.is_finite() && *p > 0.0);
        let mileage = rules.known(raw.mileage).and_then(|m| parse_mileage(&m));

        if vin.is_none() && stock.is_none() && (year.is_none() || make.is_none() || model.is_none())
        {
            return None;
        }

        let identity_key = identity_key(
            vin.as_deref(),
            stock.as_deref(),
            year,
            make.as_deref(),
            model.as_deref(),
            trim.as_deref(),
            price,
        );
        Some(VehicleRecord {
            identity_key,
            vin,
            stock_number: stock,
            year,
            make,
            model,
            trim,
            condition,
            vehicle_type,
            price,
            mileage,
            source_url: raw.url,
        })
    }
}

/// `vin:<vin>`, else `stock:<stock>`, else `ymmtp:<year>|<make>|<model>|<trim>|<price>`.
pub fn identity_key(
    vin: Option<&str>,
    stock: Option<&str>,
    year: Option<u16>,
    make: Option<&str>,
    model: Option<&str>,
    trim: Option<&str>,
    price: Option<f64>,
) -> String {
    if let Some(vin) = vin {
        return format!("vin:{}", vin.to_lowercase());
    }
    if let Some(stock) = stock {
        return format!("stock:{}", stock.to_lowercase());
    }
    format!(
        "ymmtp:{}|{}|{}|{}|{}",
        year.map(|y| y.to_string()).unwrap_or_default(),
        make.unwrap_or_default(),
        model.unwrap_or_default(),
        trim.unwrap_or_default(),
        price.map(|p| p.to_string()).unwrap_or_default(),
    )
    .to_lowercase()
}

/// Certified beats used, which beats new.
pub fn normalize_condition(text: &str) -> Option<Condition> {
    let t = text.to_lowercase();
    if t.contains("certified") || WORD_CPO.is_match(&t) {
        Some(Condition::Cpo)
    } else if ["used", "pre-owned", "preowned", "pre owned"]
        .iter()
        .any(|w| t.contains(w))
    {
        Some(Condition::Used)
    } else if WORD_NEW.is_match(&t) || t.contains("newcondition") {
        Some(Condition::New)
    } else {
        None
    }
}

/// Condition implied by the listing page address, e.g. `/used-inventory`.
pub fn condition_hint(url: &str) -> Option<Condition> {
    let Ok(parsed) = Url::parse(url) else {
        return None;
    };
    let path = format!(
        "{}?{}",
        parsed.path().to_ascii_lowercase(),
        parsed.query().unwrap_or_default().to_ascii_lowercase()
    );
    if path.contains("certified") || path.contains("cpo") {
        Some(Condition::Cpo)
    } else if path.contains("used") || path.contains("pre-owned") || path.contains("preowned") {
        Some(Condition::Used)
    } else if path.contains("searchnew") || URL_NEW.is_match(&path) {
        Some(Condition::New)
    } else {
        None
    }
}

/// Last non-monthly currency amount in `text`; bare numbers are accepted when no `$` appears.
pub fn parse_price(text: &str) -> Option<f64> {
    let mut last = None;
    let mut saw_currency = false;
    for caps in PRICE.captures_iter(text) {
        saw_currency = true;
        let Some(whole) = caps.get(0) else {
            continue;
        };
        if MONTHLY_TAIL.is_match(&text[whole.end()..]) {
            continue;
        }
        let digits = caps.get(1).map(|m| m.as_str().replace(',', ""));
        let cents = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        if let Some(value) = digits.and_then(|d| format!("{d}{cents}").parse::<f64>().ok()) {
            last = Some(value);
        }
    }
    if saw_currency {
        return last;
    }
    let cleaned = text
        .chars()
        .filter(|c| !matches!(c, ',' | ' '))
        .collect::<String>();
    cleaned.parse::<f64>().ok().filter(|p| p.is_finite())
}

fn parse_year(text: &str) -> Option<u16> {
    capture(&YEAR, text).and_then(|y| y.parse().ok())
}

fn parse_mileage(text: &str) -> Option<u32> {
    let digits = text
        .split(|c: char| !c.is_ascii_digit() && c != ',')
        .find(|s| s.chars().any(|c| c.is_ascii_digit()))?
        .replace(',', "");
    digits.parse().ok()
}

fn normalize_vin(raw: &str) -> Option<String> {
    let vin = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    let valid = vin.len() == 17
        && vin
            .chars()
            .all(|c| c.is_ascii_digit() || (c.is_ascii_uppercase() && !matches!(c, 'I' | 'O' | 'Q')))
        && vin.chars().any(|c| c.is_ascii_digit());
    valid.then_some(vin)
}

fn json_ld_vehicles(blocks: &[JsonValue]) -> Vec<RawVehicle> {
    let mut nodes = Vec::new();
    for block in blocks {
        collect_vehicle_nodes(block, &mut nodes);
    }
    nodes.into_iter().map(raw_from_json_ld).collect()
}

/// `@type` values without a vocabulary prefix such as `schema:` or `https://schema.org/`.
fn node_types(node: &JsonValue) -> Vec<&str> {
    match node.get("@type") {
        Some(JsonValue::String(t)) => vec![bare_type(t)],
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(JsonValue::as_str)
            .map(bare_type)
            .collect(),
        _ => Vec::new(),
    }
}

fn bare_type(t: &str) -> &str {
    t.rsplit(['/', ':']).next().unwrap_or(t)
}

fn collect_vehicle_nodes<'a>(value: &'a JsonValue, out: &mut Vec<&'a JsonValue>) {
    match value {
        JsonValue::Array(items) => {
            for item in items {
                collect_vehicle_nodes(item, out);
            }
        }
        JsonValue::Object(map) => {
            if let Some(graph) = map.get("@graph") {
                collect_vehicle_nodes(graph, out);
            }
            let types = node_types(value);
            if types.contains(&"ItemList") {
                if let Some(elements) = map.get("itemListElement") {
                    collect_vehicle_nodes(elements, out);
                }
            } else if types.contains(&"ListItem") {
                if let Some(item) = map.get("item") {
                    collect_vehicle_nodes(item, out);
                }
            } else if is_vehicle_node(value, &types) {
                out.push(value);
            }
        }
        _ => {}
    }
}

fn is_vehicle_node(node: &JsonValue, types: &[&str]) -> bool {
    if types
        .iter()
        .any(|t| matches!(*t, "Car" | "Vehicle" | "MotorVehicle"))
    {
        return true;
    }
    types
        .iter()
        .any(|t| matches!(*t, "Product" | "IndividualProduct"))
        && (node.get("vehicleIdentificationNumber").is_some()
            || node.get("vehicleModelDate").is_some()
            || (node.get("brand").is_some() && node.get("model").is_some()))
}

fn json_scalar(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => text_or_none(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Object(map) => map.get("name").and_then(json_scalar),
        JsonValue::Array(items) => items.iter().find_map(json_scalar),
        _ => None,
    }
}

fn json_field(node: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| node.get(*k).and_then(json_scalar))
}

fn json_price(node: &JsonValue, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match node.get(*k)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_price(s),
        _ => None,
    })
}

fn raw_from_json_ld(node: &JsonValue) -> RawVehicle {
    let offers = match node.get("offers") {
        Some(JsonValue::Array(items)) => items.first(),
        other => other,
    };
    let offer_price = offers.and_then(|o| {
        json_price(o, &["price", "lowPrice"]).or_else(|| {
            o.get("priceSpecification")
                .and_then(|p| json_price(p, &["price"]))
        })
    });
    let id_like = json_field(node, &["sku", "productID", "mpn"]);
    let id_is_vin = id_like.as_deref().and_then(normalize_vin).is_some();

    RawVehicle {
        vin: json_field(node, &["vehicleIdentificationNumber", "vin"])
            .or_else(|| id_like.clone().filter(|_| id_is_vin)),
        stock: json_field(node, &["stockNumber"]).or_else(|| id_like.filter(|_| !id_is_vin)),
        year: json_field(
            node,
            &["vehicleModelDate", "modelDate", "productionDate", "releaseDate"],
        ),
        make: json_field(node, &["brand", "manufacturer", "make"]),
        model: json_field(node, &["model"]),
        trim: json_field(node, &["vehicleConfiguration", "trim"]),
        title: json_field(node, &["name"]),
        condition: json_field(node, &["itemCondition", "vehicleCondition"])
            .or_else(|| offers.and_then(|o| json_field(o, &["itemCondition"]))),
        body: json_field(node, &["bodyType"]),
        price: None,
        price_value: offer_price.or_else(|| json_price(node, &["price"])),
        mileage: node
            .get("mileageFromOdometer")
            .and_then(|m| json_scalar(m.get("value").unwrap_or(m))),
        url: json_field(node, &["url"]).or_else(|| offers.and_then(|o| json_field(o, &["url"]))),
        badge_cpo: false,
    }
}
