use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

const DEFAULT_PERSONA: &str = "You are Herald, a curious and well-read commentator on artificial intelligence, \
technology and philosophy. You write short, specific replies that add one real idea to the conversation. \
You never use hashtags, never mention that you are automated, and never insult anyone.";

/// Every tunable of the engine, with production defaults.
#[derive(Clone, Debug)]
pub struct Policy {
    // Admission control
    pub daily_read_limit: u64,
    pub daily_write_limit: u64,
    pub max_mentions_per_hour: u64,

    // Scheduling
    pub high_priority_interval: Duration,
    pub medium_priority_interval: Duration,
    pub low_priority_interval: Duration,
    pub batch_stagger: Duration,
    pub mention_interval: Duration,

    // Fetching
    pub search_max_results: u32,
    pub thread_max_posts: u32,

    // Filtering
    pub max_post_age: chrono::Duration,
    pub min_text_len: usize,
    pub max_urls: usize,
    pub max_mentions: usize,

    // Replies
    pub max_reply_len: usize,
    pub truncated_reply_len: usize,
    pub persona: String,

    // Hardening
    pub call_timeout: Duration,
    pub generation_timeout: Duration,
    pub store_timeout: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            daily_read_limit: 100,
            daily_write_limit: 50,
            max_mentions_per_hour: 10,
            high_priority_interval: Duration::from_secs(30 * 60),
            medium_priority_interval: Duration::from_secs(60 * 60),
            low_priority_interval: Duration::from_secs(120 * 60),
            batch_stagger: Duration::from_secs(5),
            mention_interval: Duration::from_secs(15 * 60),
            search_max_results: 50,
            thread_max_posts: 20,
            max_post_age: chrono::Duration::hours(24),
            min_text_len: 50,
            max_urls: 2,
            max_mentions: 3,
            max_reply_len: 280,
            truncated_reply_len: 247,
            persona: DEFAULT_PERSONA.to_string(),
            call_timeout: Duration::from_secs(30),
            generation_timeout: Duration::from_secs(60),
            store_timeout: Duration::from_secs(5),
        }
    }
}

impl Policy {
    /// Apply `HERALD_*` overrides on top of the defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            daily_read_limit: env_u64("HERALD_DAILY_READ_LIMIT").unwrap_or(d.daily_read_limit),
            daily_write_limit: env_u64("HERALD_DAILY_WRITE_LIMIT").unwrap_or(d.daily_write_limit),
            max_mentions_per_hour: env_u64("HERALD_MAX_MENTIONS_PER_HOUR")
                .unwrap_or(d.max_mentions_per_hour),
            high_priority_interval: env_minutes("HERALD_HIGH_INTERVAL_MINUTES")
                .unwrap_or(d.high_priority_interval),
            medium_priority_interval: env_minutes("HERALD_MEDIUM_INTERVAL_MINUTES")
                .unwrap_or(d.medium_priority_interval),
            low_priority_interval: env_minutes("HERALD_LOW_INTERVAL_MINUTES")
                .unwrap_or(d.low_priority_interval),
            batch_stagger: env_u64("HERALD_BATCH_STAGGER_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.batch_stagger),
            mention_interval: env_minutes("HERALD_MENTION_INTERVAL_MINUTES")
                .unwrap_or(d.mention_interval),
            search_max_results: env_u32("HERALD_SEARCH_MAX_RESULTS")
                .unwrap_or(d.search_max_results),
            thread_max_posts: env_u32("HERALD_THREAD_MAX_POSTS")
                .unwrap_or(d.thread_max_posts)
                .clamp(10, 20),
            persona: env_str("HERALD_PERSONA")
                .and_then(non_empty)
                .unwrap_or(d.persona),
            call_timeout: env_u64("HERALD_CALL_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.call_timeout),
            generation_timeout: env_u64("HERALD_GENERATION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.generation_timeout),
            ..d
        }
    }
}

/// Typed process configuration: credentials, file locations and the policy.
#[derive(Clone, Debug)]
pub struct Config {
    // X API
    pub x_bearer_token: String,
    pub x_user_token: String,
    pub x_api_base: String,
    pub bot_handle: Option<String>,

    // Generation
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_base_url: String,

    // Files
    pub accounts_file: PathBuf,
    pub database_path: PathBuf,

    pub policy: Policy,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let x_bearer_token = required("X_BEARER_TOKEN")?;
        let x_user_token = required("X_USER_TOKEN")?;
        let openai_api_key = required("OPENAI_API_KEY")?;

        let x_api_base =
            env_str("X_API_BASE").unwrap_or_else(|| "https://api.twitter.com/2".to_string());
        let bot_handle = env_str("HERALD_BOT_HANDLE")
            .and_then(non_empty)
            .map(|h| h.trim().trim_start_matches('@').to_string());

        let openai_model = env_str("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());
        let openai_base_url = env_str("OPENAI_BASE_URL")
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        let accounts_file = PathBuf::from(
            env_str("HERALD_ACCOUNTS_FILE").unwrap_or_else(|| "accounts.json".to_string()),
        );
        let database_path = PathBuf::from(
            env_str("HERALD_DATABASE_PATH").unwrap_or_else(|| "herald.db".to_string()),
        );

        Ok(Self {
            x_bearer_token,
            x_user_token,
            x_api_base,
            bot_handle,
            openai_api_key,
            openai_model,
            openai_base_url,
            accounts_file,
            database_path,
            policy: Policy::from_env(),
        })
    }
}

fn required(key: &str) -> Result<String> {
    env_str(key)
        .and_then(non_empty)
        .ok_or_else(|| Error::Config(format!("{key} environment variable is required")))
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_minutes(key: &str) -> Option<Duration> {
    env_u64(key)
        .filter(|m| *m > 0)
        .map(|m| Duration::from_secs(m * 60))
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_quota_policy() {
        let p = Policy::default();
        assert_eq!(p.daily_read_limit, 100);
        assert_eq!(p.daily_write_limit, 50);
        assert_eq!(p.search_max_results, 50);
        assert_eq!(p.max_reply_len, 280);
        assert_eq!(p.mention_interval, Duration::from_secs(900));
    }

    #[test]
    fn dotenv_does_not_override_existing_env() {
        let path = std::env::temp_dir().join(format!("herald-dotenv-{}", std::process::id()));
        fs::write(
            &path,
            "# comment\nHERALD_TEST_DOTENV_A=\"from-file\"\nHERALD_TEST_DOTENV_B=file\n",
        )
        .unwrap();
        env::set_var("HERALD_TEST_DOTENV_B", "from-env");

        load_dotenv_if_present(&path);

        assert_eq!(env::var("HERALD_TEST_DOTENV_A").unwrap(), "from-file");
        assert_eq!(env::var("HERALD_TEST_DOTENV_B").unwrap(), "from-env");
        let _ = fs::remove_file(path);
    }
}
