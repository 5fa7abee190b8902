//! Tool detection driven by a weighted signature table.
//!
//! Each tool has signatures; a signature carries a weight and a matcher. A tool is present
//! when the heaviest signature that matches any page reaches the table threshold. Anything
//! weaker is treated as ambiguous and reported absent.

use dossier_core::ToolSet;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;

use crate::{compile_selector, PageKind, PageSnapshot, RuleError, SiteSnapshot};

pub const DEFAULT_THRESHOLD: f64 = 0.7;

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

fn one() -> usize {
    1
}

#[derive(Debug, Deserialize)]
struct ToolRulesDoc {
    #[serde(default = "default_threshold")]
    threshold: f64,
    tools: Vec<ToolDoc>,
}

#[derive(Debug, Deserialize)]
struct ToolDoc {
    tool: String,
    signatures: Vec<SignatureDoc>,
}

#[derive(Debug, Deserialize)]
struct SignatureDoc {
    name: String,
    weight: f64,
    #[serde(default)]
    pages: Vec<PageKind>,
    when: MatcherDoc,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
enum MatcherDoc {
    Keyword {
        any: Vec<String>,
    },
    Pattern {
        regex: String,
        #[serde(default = "one")]
        min_count: usize,
        #[serde(default)]
        scope: TextScope,
    },
    Selector {
        css: String,
        #[serde(default = "one")]
        min_count: usize,
    },
    Widget {
        hosts: Vec<String>,
    },
    All {
        of: Vec<MatcherDoc>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TextScope {
    #[default]
    Text,
    Html,
}

#[derive(Debug, Clone)]
enum Matcher {
    Keyword(Vec<String>),
    Pattern {
        regex: Regex,
        min_count: usize,
        scope: TextScope,
    },
    Selector {
        selector: Selector,
        min_count: usize,
    },
    Widget(Vec<String>),
    All(Vec<Matcher>),
}

impl Matcher {
    fn compile(rule: &str, doc: MatcherDoc) -> Result<Self, RuleError> {
        Ok(match doc {
            MatcherDoc::Keyword { any } => {
                if any.is_empty() {
                    return Err(invalid(rule, "keyword list is empty"));
                }
                Self::Keyword(any.into_iter().map(|k| k.to_lowercase()).collect())
            }
            MatcherDoc::Pattern {
                regex,
                min_count,
                scope,
            } => Self::Pattern {
                regex: Regex::new(&regex).map_err(|source| RuleError::Regex {
                    rule: rule.to_string(),
                    pattern: regex.clone(),
                    source,
                })?,
                min_count: min_count.max(1),
                scope,
            },
            MatcherDoc::Selector { css, min_count } => Self::Selector {
                selector: compile_selector(rule, &css)?,
                min_count: min_count.max(1),
            },
            MatcherDoc::Widget { hosts } => {
                if hosts.is_empty() {
                    return Err(invalid(rule, "widget host list is empty"));
                }
                Self::Widget(hosts.into_iter().map(|h| h.to_lowercase()).collect())
            }
            MatcherDoc::All { of } => {
                if of.is_empty() {
                    return Err(invalid(rule, "`all` needs at least one matcher"));
                }
                Self::All(
                    of.into_iter()
                        .map(|m| Self::compile(rule, m))
                        .collect::<Result<_, _>>()?,
                )
            }
        })
    }

    fn matches(&self, view: &PageView<'_>) -> bool {
        match self {
            Self::Keyword(phrases) => phrases.iter().any(|p| view.text_lower.contains(p)),
            Self::Pattern {
                regex,
                min_count,
                scope,
            } => {
                let haystack = match scope {
                    TextScope::Text => view.page.text.as_str(),
                    TextScope::Html => view.page.html.as_str(),
                };
                regex.find_iter(haystack).take(*min_count).count() >= *min_count
            }
            Self::Selector {
                selector,
                min_count,
            } => view.document.select(selector).take(*min_count).count() >= *min_count,
            Self::Widget(hosts) => view
                .sources
                .iter()
                .any(|src| hosts.iter().any(|h| src.contains(h))),
            Self::All(parts) => parts.iter().all(|m| m.matches(view)),
        }
    }
}

fn invalid(rule: &str, message: &str) -> RuleError {
    RuleError::Invalid {
        rule: rule.to_string(),
        message: message.to_string(),
    }
}

#[derive(Debug, Clone)]
struct Signature {
    name: String,
    weight: f64,
    pages: Vec<PageKind>,
    matcher: Matcher,
}

impl Signature {
    fn applies_to(&self, kind: PageKind) -> bool {
        self.pages.is_empty() || self.pages.contains(&kind)
    }
}

#[derive(Debug, Clone)]
struct ToolRule {
    tool: String,
    signatures: Vec<Signature>,
}

/// Compiled, validated rule table.
#[derive(Debug, Clone)]
pub struct ToolRuleTable {
    threshold: f64,
    rules: Vec<ToolRule>,
}

impl ToolRuleTable {
    pub fn from_yaml_str(raw: &str) -> Result<Self, RuleError> {
        let doc: ToolRulesDoc = serde_yaml::from_str(raw)?;
        if !(0.0..=1.0).contains(&doc.threshold) {
            return Err(invalid(
                "threshold",
                &format!("{} is outside 0..=1", doc.threshold),
            ));
        }
        let mut rules: Vec<ToolRule> = Vec::with_capacity(doc.tools.len());
        for tool in doc.tools {
            if rules.iter().any(|r| r.tool == tool.tool) {
                return Err(invalid(&tool.tool, "tool is defined twice"));
            }
            if tool.signatures.is_empty() {
                return Err(invalid(&tool.tool, "tool has no signatures"));
            }
            let mut signatures = Vec::with_capacity(tool.signatures.len());
            for sig in tool.signatures {
                let rule = format!("{}/{}", tool.tool, sig.name);
                if !(0.0..=1.0).contains(&sig.weight) {
                    return Err(invalid(
                        &rule,
                        &format!("weight {} is outside 0..=1", sig.weight),
                    ));
                }
                signatures.push(Signature {
                    matcher: Matcher::compile(&rule, sig.when)?,
                    name: sig.name,
                    weight: sig.weight,
                    pages: sig.pages,
                });
            }
            rules.push(ToolRule {
                tool: tool.tool,
                signatures,
            });
        }
        Ok(Self {
            threshold: doc.threshold,
            rules,
        })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.tool.as_str())
    }
}

struct PageView<'a> {
    page: &'a PageSnapshot,
    document: Html,
    text_lower: String,
    sources: Vec<String>,
}

impl<'a> PageView<'a> {
    fn new(page: &'a PageSnapshot) -> Self {
        let document = Html::parse_document(&page.html);
        let mut sources = Vec::new();
        if let Ok(sel) = Selector::parse("iframe, script, link, form, embed, object") {
            for el in document.select(&sel) {
                for attr in ["src", "href", "action", "data", "data-src"] {
                    if let Some(value) = el.value().attr(attr) {
                        sources.push(value.to_ascii_lowercase());
                    }
                }
            }
        }
        Self {
            page,
            text_lower: page.text.to_lowercase(),
            document,
            sources,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDetection {
    pub tool: String,
    pub present: bool,
    /// Weight of the strongest matching signature, 0 when nothing matched.
    pub confidence: f64,
    pub signature: Option<String>,
    pub page_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ToolDetector {
    table: ToolRuleTable,
}

impl ToolDetector {
    pub fn new(table: ToolRuleTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &ToolRuleTable {
        &self.table
    }

    pub fn detect(&self, snapshot: &SiteSnapshot) -> ToolSet {
        self.detect_with_evidence(snapshot)
            .into_iter()
            .map(|d| (d.tool, d.present))
            .collect()
    }

    /// One entry per tool in table order.
    pub fn detect_with_evidence(&self, snapshot: &SiteSnapshot) -> Vec<ToolDetection> {
        let views = snapshot.pages.iter().map(PageView::new).collect::<Vec<_>>();
        self.table
            .rules
            .iter()
            .map(|rule| {
                let mut best: Option<(&Signature, &PageView<'_>)> = None;
                for sig in &rule.signatures {
                    if best.map(|(b, _)| b.weight >= sig.weight).unwrap_or(false) {
                        continue;
                    }
                    if let Some(view) = views
                        .iter()
                        .find(|v| sig.applies_to(v.page.kind) && sig.matcher.matches(v))
                    {
                        best = Some((sig, view));
                    }
                }
                let confidence = best.map(|(s, _)| s.weight).unwrap_or(0.0);
                ToolDetection {
                    tool: rule.tool.clone(),
                    present: confidence >= self.table.threshold,
                    confidence,
                    signature: best.map(|(s, _)| s.name.clone()),
                    page_url: best.map(|(_, v)| v.page.url.clone()),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuleSet;
    use chrono::Utc;
    use dossier_core::{ScrapeTarget, TRACKED_TOOLS};
    use uuid::Uuid;

    fn snapshot(pages: &[(PageKind, &str)]) -> SiteSnapshot {
        SiteSnapshot {
            target: ScrapeTarget::competitor("Rival", "https://rival.example"),
            session_id: Uuid::new_v4(),
            pages: pages
                .iter()
                .enumerate()
                .map(|(i, (kind, html))| {
                    PageSnapshot::from_html(
                        format!("https://rival.example/p{i}"),
                        *kind,
                        200,
                        *html,
                        Utc::now(),
                    )
                })
                .collect(),
        }
    }

    fn builtin() -> ToolDetector {
        ToolDetector::new(RuleSet::builtin().expect("rules").tools)
    }

    #[test]
    fn output_covers_every_tool_even_for_empty_sites() {
        let tools = builtin().detect(&snapshot(&[(PageKind::Home, "<p>Welcome</p>")]));
        assert_eq!(tools.len(), TRACKED_TOOLS.len());
        for name in TRACKED_TOOLS {
            assert_eq!(tools.get(name), Some(&false), "{name}");
        }
    }

    #[test]
    fn srp_payments_need_repeated_monthly_figures_on_listing_pages() {
        let listing = r#"<div class="card">$38,900 or $489/mo</div>
                         <div class="card">$41,200 or $515/mo</div>"#;
        let detector = builtin();

        let on_listing = detector.detect(&snapshot(&[(PageKind::Listing, listing)]));
        assert!(on_listing["srp_payments_shown"]);
        assert!(!on_listing["vdp_payments_shown"]);

        let on_home = detector.detect(&snapshot(&[(PageKind::Home, listing)]));
        assert!(!on_home["srp_payments_shown"]);

        let single = detector.detect(&snapshot(&[(
            PageKind::Listing,
            r#"<div class="card">$38,900 or $489/mo</div>"#,
        )]));
        assert!(!single["srp_payments_shown"]);
    }

    #[test]
    fn ambiguous_keyword_alone_resolves_to_false() {
        let tools = builtin().detect(&snapshot(&[(
            PageKind::Home,
            "<p>Ask us about lease specials this month!</p>",
        )]));
        assert!(!tools["lease_payment_options"]);

        let tools = builtin().detect(&snapshot(&[(
            PageKind::Home,
            "<p>Lease a new Camry for $299/mo for 36 months.</p>",
        )]));
        assert!(tools["lease_payment_options"]);
    }

    #[test]
    fn any_page_can_satisfy_a_tool() {
        let tools = builtin().detect(&snapshot(&[
            (PageKind::Home, "<p>Welcome</p>"),
            (
                PageKind::Finance,
                r#"<iframe src="https://widgets.tradepending.com/snap?dealer=1"></iframe>"#,
            ),
        ]));
        assert!(tools["trade_in_tool"]);
        assert!(!tools["payment_calculator"]);
    }

    #[test]
    fn evidence_names_the_winning_signature() {
        let detections = builtin().detect_with_evidence(&snapshot(&[(
            PageKind::Detail,
            "<p>Financing from 3.9% APR for qualified buyers. Est. $612/mo</p>",
        )]));
        let apr = detections
            .iter()
            .find(|d| d.tool == "apr_disclosure")
            .expect("apr row");
        assert!(apr.present);
        assert!(apr.confidence >= DEFAULT_THRESHOLD);
        assert!(apr.signature.is_some());
        assert_eq!(apr.page_url.as_deref(), Some("https://rival.example/p0"));
        let vdp = detections
            .iter()
            .find(|d| d.tool == "vdp_payments_shown")
            .expect("vdp row");
        assert!(vdp.present);
    }

    #[test]
    fn invalid_rows_fail_at_load_time() {
        let bad_regex = r#"
tools:
  - tool: broken
    signatures:
      - name: bad
        weight: 0.9
        when: { match: pattern, regex: "(unclosed" }
"#;
        assert!(matches!(
            ToolRuleTable::from_yaml_str(bad_regex),
            Err(RuleError::Regex { .. })
        ));

        let bad_selector = r#"
tools:
  - tool: broken
    signatures:
      - name: bad
        weight: 0.9
        when: { match: selector, css: "div[[" }
"#;
        assert!(matches!(
            ToolRuleTable::from_yaml_str(bad_selector),
            Err(RuleError::Selector { .. })
        ));

        let bad_weight = r#"
tools:
  - tool: broken
    signatures:
      - name: heavy
        weight: 1.5
        when: { match: keyword, any: [x] }
"#;
        assert!(matches!(
            ToolRuleTable::from_yaml_str(bad_weight),
            Err(RuleError::Invalid { .. })
        ));
    }

    #[test]
    fn custom_tables_can_add_tools() {
        let table = ToolRuleTable::from_yaml_str(
            r#"
threshold: 0.5
tools:
  - tool: live_chat
    signatures:
      - name: chat-widget
        weight: 0.6
        when: { match: widget, hosts: [livechatinc.com] }
"#,
        )
        .expect("table");
        let tools = ToolDetector::new(table).detect(&snapshot(&[(
            PageKind::Home,
            r#"<script src="https://cdn.livechatinc.com/tracking.js"></script>"#,
        )]));
        assert_eq!(tools.len(), 1);
        assert!(tools["live_chat"]);
    }
}
