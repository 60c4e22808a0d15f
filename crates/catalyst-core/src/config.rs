use anyhow::Result;
use std::collections::HashMap;

/// Process configuration loaded once at startup from the environment, with
/// an optional `.env` overlay for local development.
#[derive(Debug, Clone)]
pub struct Config {
    /// Forces the environment probe's mode instead of auto-detecting.
    pub mode_override: String,

    pub state_store_url: String,
    pub broker_url: String,

    /// "local", "remote", or "both".
    pub git_mode: String,
    pub git_token: String,
    pub git_author_name: String,
    pub git_author_email: String,
    /// Parent directory under which each project's repo checkout lives
    /// (`{repo_root}/{project_id}`).
    pub repo_root: String,

    /// "docker_in_docker", "compose_only", or "traefik".
    pub preview_mode: String,
    pub preview_domain: String,
    pub preview_ttl_hours: i64,
    pub port_range_start: u16,
    pub port_range_end: u16,

    pub max_sandbox_concurrency: u32,
    pub agent_timeout_secs: u64,
    pub coder_rework_max: u32,
    pub test_coverage_threshold: Option<u32>,
    pub dlq_name: String,

    pub web_bind: String,
    pub web_port: u16,

    pub sandbox_backend: String,
    pub container_image: String,
    pub container_memory_mb: u64,

    pub llm_api_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_opt_u32(key: &str, dotenv: &HashMap<String, String>) -> Option<u32> {
    get(key, dotenv).and_then(|v| v.parse().ok())
}

/// Resolves a leading `~/` against `$HOME`; anything else passes through.
pub fn resolve_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        let (port_range_start, port_range_end) = get_str("PORT_RANGE", &dotenv, "9000..9999")
            .split_once("..")
            .and_then(|(a, b)| Some((a.parse().ok()?, b.parse().ok()?)))
            .unwrap_or((9000, 9999));

        Ok(Config {
            mode_override: get_str("MODE", &dotenv, ""),
            state_store_url: get_str("STATE_STORE_URL", &dotenv, ""),
            broker_url: get_str("BROKER_URL", &dotenv, ""),
            git_mode: get_str("GIT_MODE", &dotenv, "local"),
            git_token: get_str("GIT_TOKEN", &dotenv, ""),
            git_author_name: get_str("GIT_AUTHOR_NAME", &dotenv, "catalyst-agent"),
            git_author_email: get_str("GIT_AUTHOR_EMAIL", &dotenv, "agent@catalyst.local"),
            repo_root: get_str("REPO_ROOT", &dotenv, "./work/repos"),
            preview_mode: get_str("PREVIEW_MODE", &dotenv, "docker_in_docker"),
            preview_domain: get_str("PREVIEW_DOMAIN", &dotenv, "preview.local"),
            preview_ttl_hours: get_i64("PREVIEW_TTL_HOURS", &dotenv, 24),
            port_range_start,
            port_range_end,
            max_sandbox_concurrency: get_u32("MAX_SANDBOX_CONCURRENCY", &dotenv, 8),
            agent_timeout_secs: get_u64("AGENT_TIMEOUT_SECS", &dotenv, 300),
            coder_rework_max: get_u32("CODER_REWORK_MAX", &dotenv, 2),
            test_coverage_threshold: get_opt_u32("TEST_COVERAGE_THRESHOLD", &dotenv)
                .or(Some(80)),
            dlq_name: get_str("DLQ_NAME", &dotenv, "failed-events"),
            web_bind: get_str("WEB_BIND", &dotenv, "127.0.0.1"),
            web_port: get_u16("WEB_PORT", &dotenv, 3131),
            sandbox_backend: get_str("SANDBOX_BACKEND", &dotenv, "auto"),
            container_image: get_str("CONTAINER_IMAGE", &dotenv, "catalyst-runner"),
            container_memory_mb: get_u64("CONTAINER_MEMORY_MB", &dotenv, 512),
            llm_api_url: get_str("LLM_API_URL", &dotenv, ""),
            llm_api_key: get_str("LLM_API_KEY", &dotenv, ""),
            llm_model: get_str("LLM_MODEL", &dotenv, ""),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_hold_without_env_or_dotenv() {
        let dotenv = HashMap::new();
        assert_eq!(get_u16("NONEXISTENT_PORT", &dotenv, 3131), 3131);
        assert_eq!(get_str("NONEXISTENT_STR", &dotenv, "x"), "x");
    }

    #[test]
    fn resolve_tilde_expands_home() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(resolve_tilde("~/data"), "/home/tester/data");
        assert_eq!(resolve_tilde("/abs/data"), "/abs/data");
    }

    #[test]
    fn port_range_parses_default() {
        let dotenv = HashMap::new();
        let (a, b) = get_str("PORT_RANGE", &dotenv, "9000..9999")
            .split_once("..")
            .and_then(|(a, b)| Some((a.parse::<u16>().ok()?, b.parse::<u16>().ok()?)))
            .unwrap();
        assert_eq!((a, b), (9000, 9999));
    }
}
