//! Rule evaluation engine (C3): declarative conditions plus a compiled-predicate scripting hook.
//!
//! The two rule slots a session owns (breakpoint, history) share this schema. Evaluation order is
//! fixed: ignore-extensions, then methods, then conditions (OR across conditions, OR across each
//! condition's `\n`-split alternatives), then an optional compiled script as a final override.
//!
//! The scripting hook is implemented as a compiled CEL predicate rather than a pooled Lua
//! interpreter — the alternative `SPEC_FULL.md` §9 ("Embedded scripting") explicitly sanctions.
//! The script is handed a `flow` map exposing `host`, `uri`, `request`, `query`, `ua`, `body`,
//! `header` (a string-to-string map, standing in for the original's `h_<name>` dynamic fields),
//! `query_params` (likewise for `a_<name>`), and `raw` (the dumped request, for
//! `raw.contains("needle")` in place of the original's `have(...)`). Because the predicate is a
//! single boolean expression, there's no "neither wait() nor pass() called" case to default —
//! the script's result *is* the match decision. See `DESIGN.md`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use cel::objects::{ListValue, MapValue, Value};
use cel::{Context, Program, context};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::RuleError;
use crate::flow::Flow;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rule {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub ignore_extensions: Vec<String>,
	#[serde(default)]
	pub methods: Vec<String>,
	#[serde(default)]
	pub conditions: Vec<Condition>,
	#[serde(default)]
	pub phases: HashSet<String>,
	#[serde(default)]
	pub script: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
	pub key: String,
	pub op: String,
	pub data: String,
}

/// A [`Rule`] with its script compiled once, ready for repeated evaluation.
pub struct CompiledRule {
	pub rule: Rule,
	program: Option<Program>,
}

impl CompiledRule {
	/// Compiles `rule`'s script, if any. A compile failure is logged and leaves the script slot
	/// empty — the rule still matches on conditions alone, per the error-handling policy.
	pub fn compile(rule: Rule) -> CompiledRule {
		let program = if rule.script.trim().is_empty() {
			None
		} else {
			match Program::compile(&rule.script) {
				Ok(p) => Some(p),
				Err(e) => {
					tracing::warn!(error = %e, "rule script compile failed, ignoring script");
					None
				},
			}
		};
		CompiledRule { rule, program }
	}

	pub fn phase_enabled(&self, phase_name: &str) -> bool {
		self.rule.phases.contains(phase_name)
	}

	/// Runs the full match algorithm against `flow`.
	pub fn matches(&self, flow: &Flow) -> bool {
		if extension_ignored(&self.rule.ignore_extensions, &flow.request_path()) {
			return false;
		}
		if !methods_match(&self.rule.methods, &flow.request.method) {
			return false;
		}
		let conditions_pass =
			self.rule.conditions.is_empty() || conditions_match(&self.rule.conditions, flow);
		if !conditions_pass {
			return false;
		}
		match &self.program {
			None => true,
			Some(program) => eval_script(program, flow),
		}
	}
}

fn extension_ignored(ignore_extensions: &[String], path: &str) -> bool {
	ignore_extensions
		.iter()
		.any(|ext| !ext.is_empty() && path.ends_with(ext.as_str()))
}

fn methods_match(methods: &[String], request_method: &str) -> bool {
	if methods.is_empty() {
		return false;
	}
	methods
		.iter()
		.any(|m| m.eq_ignore_ascii_case("any") || m.eq_ignore_ascii_case(request_method))
}

fn conditions_match(conditions: &[Condition], flow: &Flow) -> bool {
	conditions.iter().any(|c| condition_matches(c, flow))
}

fn condition_matches(condition: &Condition, flow: &Flow) -> bool {
	let value = resolve_key(&condition.key, flow);
	let (apply, negate) = condition_predicate(&condition.op);
	let matched = condition
		.data
		.split('\n')
		.any(|alt| apply(value.as_str(), alt));
	if negate { !matched } else { matched }
}

/// Resolves a condition key against a flow. Mirrors `breakpoint_flow.go`'s `flowL.Index`:
/// `host`, `uri`, `request`, `query`, `ua`, `body`, plus `h_<name>`/`a_<name>` prefix dispatch.
pub fn resolve_key(key: &str, flow: &Flow) -> String {
	match key {
		"host" => flow
			.request_uri()
			.and_then(|u| u.host().map(str::to_string))
			.unwrap_or_default(),
		"uri" => flow.request_path(),
		"request" => flow.request.url.clone(),
		"query" => flow
			.request_uri()
			.and_then(|u| u.query().map(str::to_string))
			.unwrap_or_default(),
		"ua" => flow.request.header_value("user-agent").unwrap_or("").to_string(),
		"body" => String::from_utf8_lossy(&flow.request.body).into_owned(),
		_ => {
			if let Some(name) = key.strip_prefix("h_") {
				flow.request.header_value(name).unwrap_or("").to_string()
			} else if let Some(name) = key.strip_prefix("a_") {
				query_param(flow, name).unwrap_or_default()
			} else {
				String::new()
			}
		},
	}
}

fn query_param(flow: &Flow, name: &str) -> Option<String> {
	let query = flow.request_uri()?.query()?.to_string();
	for pair in query.split('&') {
		let mut parts = pair.splitn(2, '=');
		let k = parts.next()?;
		if k == name {
			return Some(parts.next().unwrap_or("").to_string());
		}
	}
	None
}

type Predicate = fn(&str, &str) -> bool;

/// Parses a condition operator into its predicate and negation flag. Grounded on
/// `http_uitl.go`'s `ParseCndMethod`, with `regex`/`!regex` implemented as real regex matching
/// rather than reproducing the original's equality stub (the original source's own
/// `breakpoint_flow.go` element methods use real `regexp.MatchString` for the same concept,
/// so this treats the `ParseCndMethod` stub as the bug it is — documented in `DESIGN.md`).
fn condition_predicate(op: &str) -> (Predicate, bool) {
	match op {
		"equal" => (|a, b| a == b, false),
		"!equal" => (|a, b| a == b, true),
		"regex" => (regex_is_match, false),
		"!regex" => (regex_is_match, true),
		"prefix" => (|a, b| a.starts_with(b), false),
		"!prefix" => (|a, b| a.starts_with(b), true),
		"suffix" => (|a, b| a.ends_with(b), false),
		"!suffix" => (|a, b| a.ends_with(b), true),
		"contain" => (|a, b| a.contains(b), false),
		"!contain" => (|a, b| a.contains(b), true),
		// Declared but unimplemented upstream; always false regardless of negation.
		"ip" | "!ip" => (|_, _| false, false),
		_ => (|_, _| false, false),
	}
}

fn regex_is_match(value: &str, pattern: &str) -> bool {
	match Regex::new(pattern) {
		Ok(re) => re.is_match(value),
		Err(e) => {
			tracing::warn!(pattern, error = %e, "invalid regex in condition, treating as no match");
			false
		},
	}
}

fn eval_script(program: &Program, flow: &Flow) -> bool {
	let mut ctx = Context::default();
	mitm_celx::insert_all(&mut ctx);
	let flow_value = build_flow_value(flow);
	let resolver = context::SingleVarResolver::new(&context::DefaultVariableResolver, "flow", flow_value);
	match Value::resolve(program.expression(), &ctx, &resolver) {
		Ok(Value::Bool(b)) => b,
		Ok(other) => {
			tracing::warn!(?other, "rule script did not return a bool, treating as no match");
			false
		},
		Err(e) => {
			tracing::warn!(error = %e, "rule script execution error, treating as no match");
			false
		},
	}
}

fn build_flow_value(flow: &Flow) -> Value<'static> {
	let mut map: HashMap<String, Value<'static>> = HashMap::new();
	map.insert("host".into(), string_value(resolve_key("host", flow)));
	map.insert("uri".into(), string_value(resolve_key("uri", flow)));
	map.insert("request".into(), string_value(resolve_key("request", flow)));
	map.insert("query".into(), string_value(resolve_key("query", flow)));
	map.insert("ua".into(), string_value(resolve_key("ua", flow)));
	map.insert("body".into(), string_value(resolve_key("body", flow)));
	map.insert("header".into(), header_map_value(&flow.request.header));
	map.insert("query_params".into(), query_params_value(flow));
	map.insert("raw".into(), string_value(dump_raw_request(flow)));
	Value::Map(MapValue::from(map))
}

fn string_value(s: String) -> Value<'static> {
	Value::from(s)
}

fn header_map_value(header: &BTreeMap<String, Vec<String>>) -> Value<'static> {
	let mut m: HashMap<String, Value<'static>> = HashMap::new();
	for (k, v) in header {
		m.insert(k.to_ascii_lowercase(), string_value(v.first().cloned().unwrap_or_default()));
	}
	Value::Map(MapValue::from(m))
}

fn query_params_value(flow: &Flow) -> Value<'static> {
	let mut m: HashMap<String, Value<'static>> = HashMap::new();
	if let Some(uri) = flow.request_uri() {
		if let Some(query) = uri.query() {
			for pair in query.split('&') {
				let mut parts = pair.splitn(2, '=');
				if let Some(k) = parts.next() {
					let v = parts.next().unwrap_or("").to_string();
					m.entry(k.to_string())
						.and_modify(|existing| {
							let mut items: Vec<Value<'static>> = match existing {
								Value::List(list) => list.as_ref().to_vec(),
								other => vec![other.clone()],
							};
							items.push(string_value(v.clone()));
							*existing = Value::List(ListValue::from(Arc::<[Value<'static>]>::from(items)));
						})
						.or_insert_with(|| string_value(v));
				}
			}
		}
	}
	Value::Map(MapValue::from(m))
}

/// A minimal stand-in for `httputil.DumpRequest`: request line, headers, blank line, body.
fn dump_raw_request(flow: &Flow) -> String {
	let mut out = format!(
		"{} {} {}\r\n",
		flow.request.method, flow.request.url, flow.request.proto
	);
	for (k, values) in &flow.request.header {
		for v in values {
			out.push_str(&format!("{k}: {v}\r\n"));
		}
	}
	out.push_str("\r\n");
	out.push_str(&String::from_utf8_lossy(&flow.request.body));
	out
}

#[cfg(test)]
mod tests {
	use uuid::Uuid;

	use super::*;

	fn sample_flow(method: &str, url: &str) -> Flow {
		let mut flow = Flow::new(Uuid::new_v4(), Uuid::new_v4(), "127.0.0.1:1234".into(), false);
		flow.request.method = method.into();
		flow.request.url = url.into();
		flow.request.proto = "HTTP/1.1".into();
		flow
	}

	#[test]
	fn ignore_extensions_short_circuits() {
		let rule = Rule {
			enabled: true,
			ignore_extensions: vec![".js".into()],
			methods: vec!["ANY".into()],
			..Default::default()
		};
		let compiled = CompiledRule::compile(rule);
		let flow = sample_flow("GET", "http://a.test/app.js");
		assert!(!compiled.matches(&flow));
	}

	#[test]
	fn empty_methods_never_matches() {
		let rule = Rule {
			enabled: true,
			..Default::default()
		};
		let compiled = CompiledRule::compile(rule);
		let flow = sample_flow("GET", "http://a.test/x");
		assert!(!compiled.matches(&flow));
	}

	#[test]
	fn any_method_matches_everything() {
		let rule = Rule {
			enabled: true,
			methods: vec!["any".into()],
			..Default::default()
		};
		let compiled = CompiledRule::compile(rule);
		assert!(compiled.matches(&sample_flow("POST", "http://a.test/x")));
	}

	#[test]
	fn condition_equal_on_host() {
		let rule = Rule {
			enabled: true,
			methods: vec!["ANY".into()],
			conditions: vec![Condition {
				key: "host".into(),
				op: "equal".into(),
				data: "a.test".into(),
			}],
			..Default::default()
		};
		let compiled = CompiledRule::compile(rule);
		assert!(compiled.matches(&sample_flow("GET", "http://a.test/x")));
		assert!(!compiled.matches(&sample_flow("GET", "http://b.test/x")));
	}

	#[test]
	fn condition_alternatives_are_newline_joined_or() {
		let rule = Rule {
			enabled: true,
			methods: vec!["ANY".into()],
			conditions: vec![Condition {
				key: "host".into(),
				op: "equal".into(),
				data: "a.test\nb.test".into(),
			}],
			..Default::default()
		};
		let compiled = CompiledRule::compile(rule);
		assert!(compiled.matches(&sample_flow("GET", "http://b.test/x")));
	}

	#[test]
	fn ip_operator_always_false() {
		let rule = Rule {
			enabled: true,
			methods: vec!["ANY".into()],
			conditions: vec![Condition {
				key: "host".into(),
				op: "ip".into(),
				data: "a.test".into(),
			}],
			..Default::default()
		};
		let compiled = CompiledRule::compile(rule);
		assert!(!compiled.matches(&sample_flow("GET", "http://a.test/x")));
	}

	#[test]
	fn script_predicate_overrides_conditions() {
		let rule = Rule {
			enabled: true,
			methods: vec!["ANY".into()],
			script: "flow.host == \"a.test\"".into(),
			..Default::default()
		};
		let compiled = CompiledRule::compile(rule);
		assert!(compiled.matches(&sample_flow("GET", "http://a.test/x")));
		assert!(!compiled.matches(&sample_flow("GET", "http://b.test/x")));
	}

	#[test]
	fn invalid_script_compile_falls_back_to_conditions_only() {
		let rule = Rule {
			enabled: true,
			methods: vec!["ANY".into()],
			conditions: vec![Condition {
				key: "host".into(),
				op: "equal".into(),
				data: "a.test".into(),
			}],
			script: "not valid cel {{{".into(),
			..Default::default()
		};
		let compiled = CompiledRule::compile(rule);
		assert!(compiled.matches(&sample_flow("GET", "http://a.test/x")));
	}

	#[test]
	fn query_params_value_keeps_single_value_as_string() {
		let flow = sample_flow("GET", "http://a.test/x?a=1");
		let params = query_params_value(&flow);
		let Value::Map(map) = params else { panic!("expected map") };
		let key = cel::objects::KeyRef::from("a");
		assert!(matches!(map.get(&key), Some(Value::String(s)) if s.as_ref() == "1"));
	}

	#[test]
	fn query_params_value_collects_repeats_into_an_ordered_sequence() {
		let flow = sample_flow("GET", "http://a.test/x?a=1&a=2&a=3");
		let params = query_params_value(&flow);
		let Value::Map(map) = params else { panic!("expected map") };
		let key = cel::objects::KeyRef::from("a");
		let Some(Value::List(list)) = map.get(&key) else {
			panic!("expected a multi-valued query param to resolve to a list")
		};
		let values: Vec<String> = list
			.iter()
			.map(|v| match v {
				Value::String(s) => s.as_ref().to_string(),
				other => panic!("unexpected element {other:?}"),
			})
			.collect();
		assert_eq!(values, vec!["1", "2", "3"]);
	}
}
