//! Configuration schema, loading pipeline, and macro substitution.
//!
//! `Config::load` runs a `read file -> expand env vars -> parse YAML ->
//! validate` pipeline, bailing with a specific message (`anyhow::bail!`) at
//! the first invariant violation. The macro substitution pass (`${PORT}`,
//! `${MODEL_ID}`) and the quote-aware command tokenizer resolve `cmd`/
//! `cmdStop`/`proxy` templates before a model is ever spawned.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;

const MIN_HEALTH_CHECK_TIMEOUT_SECS: u64 = 15;
const DEFAULT_START_PORT: u16 = 5800;

/// Where (if anywhere) a model's readiness should be probed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckEndpoint {
    /// `checkEndpoint: none` — the 250ms startup delay is the only gate.
    None,
    /// An HTTP path probed on `proxy` until it returns 2xx.
    Path(String),
}

/// A fully resolved model: every macro substituted, argv tokenized.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub id: String,
    pub cmd: Vec<String>,
    pub cmd_stop: Option<String>,
    pub proxy: String,
    pub check_endpoint: CheckEndpoint,
    pub env: Vec<(String, String)>,
    pub unload_after: Option<Duration>,
    pub aliases: Vec<String>,
    pub use_model_name: Option<String>,
    pub strip_params: Vec<String>,
    pub unlisted: bool,
    /// Copied down from the top-level setting so `Process` doesn't need a
    /// back-reference to the whole `Config`.
    pub health_check_timeout: Duration,
}

/// A fully resolved group.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub id: String,
    pub members: Vec<String>,
    pub swap: bool,
    pub exclusive: bool,
    pub persistent: bool,
}

/// The fully resolved, validated configuration the rest of the daemon uses.
#[derive(Debug, Clone)]
pub struct Config {
    pub health_check_timeout: Duration,
    pub start_port: u16,
    pub models: IndexMap<String, Arc<ModelConfig>>,
    pub groups: IndexMap<String, GroupConfig>,
    /// Every name a model can be addressed by (its own id, plus declared
    /// aliases) mapped to the owning model id. Computed once at load time;
    /// the dispatcher does a single hashmap lookup rather than re-deriving
    /// this on every request.
    pub aliases: HashMap<String, String>,
    pub preload: Vec<String>,
}

const DEFAULT_DEFAULT_GROUP_ID: &str = "(default)";

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw_text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let expanded = shellexpand::env(&raw_text)
            .with_context(|| "expanding environment variables in config file")?;
        let raw: RawConfig = serde_yaml_ng::from_str(&expanded)
            .with_context(|| format!("parsing YAML in {}", path.display()))?;
        build(raw)
    }

    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.aliases.get(name).map(String::as_str)
    }
}

// ---------------------------------------------------------------------
// Raw (pre-macro, pre-validation) schema, mirroring the YAML surface.
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
struct RawConfig {
    health_check_timeout: Option<u64>,
    start_port: Option<u16>,
    models: IndexMap<String, RawModelConfig>,
    groups: IndexMap<String, RawGroupConfig>,
    hooks: RawHooks,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
struct RawModelConfig {
    cmd: Option<CmdSpec>,
    cmd_stop: Option<String>,
    proxy: String,
    check_endpoint: Option<String>,
    env: Vec<String>,
    ttl: Option<u64>,
    aliases: Vec<String>,
    use_model_name: Option<String>,
    filters: RawFilters,
    unlisted: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
struct RawFilters {
    strip_params: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CmdSpec {
    Argv(Vec<String>),
    Line(String),
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawGroupConfig {
    members: Vec<String>,
    swap: bool,
    exclusive: bool,
    persistent: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
struct RawHooks {
    on_startup: RawOnStartup,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawOnStartup {
    preload: Vec<String>,
}

// ---------------------------------------------------------------------
// Build: macro substitution, tokenization, then validation.
// ---------------------------------------------------------------------

fn build(raw: RawConfig) -> Result<Config> {
    let health_check_timeout =
        Duration::from_secs(raw.health_check_timeout.unwrap_or(MIN_HEALTH_CHECK_TIMEOUT_SECS));
    if health_check_timeout.as_secs() < MIN_HEALTH_CHECK_TIMEOUT_SECS {
        bail!(
            "healthCheckTimeout must be at least {MIN_HEALTH_CHECK_TIMEOUT_SECS}s, got {}s",
            health_check_timeout.as_secs()
        );
    }
    let start_port = raw.start_port.unwrap_or(DEFAULT_START_PORT);
    if start_port == 0 {
        bail!("startPort must be a nonzero port number");
    }

    let port_by_model = assign_ports(&raw.models, start_port)?;

    let mut models = IndexMap::new();
    let mut alias_owner: HashMap<String, String> = HashMap::new();

    for (id, raw_model) in &raw.models {
        let model = build_model(id, raw_model, port_by_model.get(id).copied(), health_check_timeout)?;

        if alias_owner.insert(id.clone(), id.clone()).is_some() {
            bail!("duplicate model id '{id}'");
        }
        for alias in &model.aliases {
            if alias == id {
                continue;
            }
            if let Some(owner) = alias_owner.insert(alias.clone(), id.clone()) {
                bail!("alias '{alias}' claimed by both '{owner}' and '{id}'");
            }
        }
        models.insert(id.clone(), Arc::new(model));
    }

    let (mut groups, grouped) = build_groups(&raw.groups, &models)?;
    let ungrouped: Vec<String> = models
        .keys()
        .filter(|id| !grouped.contains(*id))
        .cloned()
        .collect();
    if !ungrouped.is_empty() {
        if groups.contains_key(DEFAULT_DEFAULT_GROUP_ID) {
            bail!(
                "group id '{DEFAULT_DEFAULT_GROUP_ID}' is reserved for ungrouped models; rename your group"
            );
        }
        groups.insert(
            DEFAULT_DEFAULT_GROUP_ID.to_string(),
            GroupConfig {
                id: DEFAULT_DEFAULT_GROUP_ID.to_string(),
                members: ungrouped,
                swap: true,
                exclusive: false,
                persistent: false,
            },
        );
    }

    for preload_name in &raw.hooks.on_startup.preload {
        if !alias_owner.contains_key(preload_name) {
            bail!("hooks.onStartup.preload references unknown model '{preload_name}'");
        }
    }

    Ok(Config {
        health_check_timeout,
        start_port,
        models,
        groups,
        aliases: alias_owner,
        preload: raw.hooks.on_startup.preload,
    })
}

/// Assign one port per model that references `${PORT}` anywhere in its
/// `cmd`/`cmdStop`/`proxy`, monotonically increasing from `start_port` in
/// config-file order. Fatal if `proxy` references `${PORT}` but `cmd`
/// doesn't, since nothing would then bind the port we hand out.
fn assign_ports(models: &IndexMap<String, RawModelConfig>, start_port: u16) -> Result<HashMap<String, u16>> {
    let mut out = HashMap::new();
    let mut next_port = start_port;
    for (id, model) in models {
        let cmd_text = match &model.cmd {
            Some(CmdSpec::Argv(v)) => v.join(" "),
            Some(CmdSpec::Line(s)) => s.clone(),
            None => String::new(),
        };
        let cmd_uses_port = cmd_text.contains("${PORT}");
        let proxy_uses_port = model.proxy.contains("${PORT}");
        let stop_uses_port = model
            .cmd_stop
            .as_deref()
            .map(|s| s.contains("${PORT}"))
            .unwrap_or(false);

        if proxy_uses_port && !cmd_uses_port {
            bail!(
                "model '{id}': proxy references ${{PORT}} but cmd does not; nothing would bind that port"
            );
        }
        if cmd_uses_port || proxy_uses_port || stop_uses_port {
            out.insert(id.clone(), next_port);
            next_port = next_port
                .checked_add(1)
                .context("start_port + model count overflowed u16")?;
        }
    }
    Ok(out)
}

static MACRO_RE_SRC: &str = r"\$\{([A-Za-z0-9_-]{1,63})\}";

fn substitute(text: &str, model_id: &str, port: Option<u16>, allow_pid: bool) -> Result<String> {
    let re = Regex::new(MACRO_RE_SRC).expect("static macro regex is valid");
    let mut unresolved = None;
    let substituted = re.replace_all(text, |caps: &regex::Captures| {
        let name = &caps[1];
        match name {
            "MODEL_ID" => model_id.to_string(),
            "PORT" => match port {
                Some(p) => p.to_string(),
                None => {
                    unresolved.get_or_insert_with(|| name.to_string());
                    caps[0].to_string()
                }
            },
            "PID" if allow_pid => caps[0].to_string(),
            other => {
                unresolved.get_or_insert_with(|| other.to_string());
                caps[0].to_string()
            }
        }
    });
    if let Some(name) = unresolved {
        bail!("model '{model_id}': unresolved macro '${{{name}}}'");
    }
    Ok(substituted.into_owned())
}

fn build_model(
    id: &str,
    raw: &RawModelConfig,
    port: Option<u16>,
    health_check_timeout: Duration,
) -> Result<ModelConfig> {
    if raw.proxy.is_empty() {
        bail!("model '{id}': proxy is required");
    }
    let proxy = substitute(&raw.proxy, id, port, false)?;

    let cmd_tokens: Vec<String> = match &raw.cmd {
        Some(CmdSpec::Argv(tokens)) => tokens
            .iter()
            .map(|t| substitute(t, id, port, false))
            .collect::<Result<_>>()?,
        Some(CmdSpec::Line(line)) => {
            let substituted = substitute(line, id, port, false)?;
            tokenize_shell(&substituted).with_context(|| format!("model '{id}': tokenizing cmd"))?
        }
        None => bail!("model '{id}': cmd is required"),
    };
    if cmd_tokens.is_empty() {
        bail!("model '{id}': cmd must not be empty");
    }

    let cmd_stop = raw
        .cmd_stop
        .as_ref()
        .map(|s| substitute(s, id, port, true))
        .transpose()?;

    let check_endpoint = match raw.check_endpoint.as_deref() {
        None => CheckEndpoint::Path("/health".to_string()),
        Some("none") | Some("") => CheckEndpoint::None,
        Some(path) => CheckEndpoint::Path(path.to_string()),
    };

    let env = raw
        .env
        .iter()
        .map(|entry| {
            let (k, v) = entry
                .split_once('=')
                .with_context(|| format!("model '{id}': env entry '{entry}' is not KEY=VALUE"))?;
            Ok((k.to_string(), substitute(v, id, port, false)?))
        })
        .collect::<Result<Vec<_>>>()?;

    let unload_after = match raw.ttl {
        None | Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
    };

    Ok(ModelConfig {
        id: id.to_string(),
        cmd: cmd_tokens,
        cmd_stop,
        proxy,
        check_endpoint,
        env,
        unload_after,
        aliases: raw.aliases.clone(),
        use_model_name: raw.use_model_name.clone(),
        strip_params: raw.filters.strip_params.clone(),
        unlisted: raw.unlisted,
        health_check_timeout,
    })
}

fn build_groups(
    raw_groups: &IndexMap<String, RawGroupConfig>,
    models: &IndexMap<String, Arc<ModelConfig>>,
) -> Result<(IndexMap<String, GroupConfig>, std::collections::HashSet<String>)> {
    let mut groups = IndexMap::new();
    let mut grouped = std::collections::HashSet::new();
    for (id, raw_group) in raw_groups {
        for member in &raw_group.members {
            if !models.contains_key(member) {
                bail!("group '{id}': member '{member}' is not a configured model");
            }
            if !grouped.insert(member.clone()) {
                bail!("model '{member}' is listed in more than one group");
            }
        }
        groups.insert(
            id.clone(),
            GroupConfig {
                id: id.clone(),
                members: raw_group.members.clone(),
                swap: raw_group.swap,
                exclusive: raw_group.exclusive,
                persistent: raw_group.persistent,
            },
        );
    }
    Ok((groups, grouped))
}

/// Split a shell-like command line into argv, honoring single and double
/// quotes (no escape sequences beyond closing the quote — callers needing
/// more should supply `cmd` as an explicit YAML list instead).
///
/// Resolves the naive-whitespace-split problem the bare config format is
/// known to have: a quoted argument containing a space no longer gets torn
/// in two.
pub fn tokenize_shell(line: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
            }
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if quote.is_some() {
        bail!("unterminated quote in command line");
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}
