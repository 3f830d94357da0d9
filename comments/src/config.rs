use std::{net::SocketAddr, str::FromStr};

use crate::paginate::{DEFAULT_PAGE_SIZE, ListingState, SortField, SortOrder};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Env {
    Dev,
    Staging,
    Production,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub env: Env,
    pub listen_addr: SocketAddr,
    pub page_size: usize,
    pub default_sort: SortField,
    pub default_order: SortOrder,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            env: Env::Dev,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            page_size: DEFAULT_PAGE_SIZE,
            default_sort: SortField::default(),
            default_order: SortOrder::default(),
        }
    }
}

fn var(key: &str) -> Result<Option<String>, String> {
    match std::env::var(key) {
        Ok(env) => Ok(Some(env)),
        Err(e) => match e {
            std::env::VarError::NotPresent => Ok(None),
            std::env::VarError::NotUnicode(_) => Err(format!(
                "Could not get the environment variable `{key}` due to unicode error"
            )),
        },
    }
}

/// Parses `key` if it is set, falling back to `default` with a warning when
/// the value can't be read or parsed.
fn parsed_var<T: FromStr>(key: &str, default: T) -> T {
    match var(key) {
        Ok(Some(val)) => match val.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!("Invalid value `{val}` for environment variable `{key}`, using default");
                default
            }
        },
        Ok(None) => default,
        Err(e) => {
            tracing::warn!("{e}, using default");
            default
        }
    }
}

impl Env {
    /// Anything other than `staging` or `production` means dev.
    fn from_var(value: Option<&str>) -> Self {
        match value {
            Some("staging") => Env::Staging,
            Some("production") => Env::Production,
            _ => Env::Dev,
        }
    }
}

fn positive_page_size(page_size: usize, default: usize) -> usize {
    if page_size == 0 {
        tracing::warn!("`COMMENTS_PAGE_SIZE` must be positive, using default");
        default
    } else {
        page_size
    }
}

impl EngineConfig {
    pub fn new_from_env() -> Self {
        let defaults = EngineConfig::default();

        EngineConfig {
            env: Env::from_var(var("ENVIRONMENT").ok().flatten().as_deref()),
            listen_addr: parsed_var("LISTEN_ADDR", defaults.listen_addr),
            page_size: positive_page_size(
                parsed_var("COMMENTS_PAGE_SIZE", defaults.page_size),
                defaults.page_size,
            ),
            default_sort: parsed_var("COMMENTS_DEFAULT_SORT", defaults.default_sort),
            default_order: parsed_var("COMMENTS_DEFAULT_ORDER", defaults.default_order),
        }
    }

    /// The listing a fresh engine starts from.
    pub fn initial_listing(&self) -> ListingState {
        ListingState {
            sort_field: self.default_sort,
            sort_order: self.default_order,
            ..ListingState::new(self.page_size)
        }
    }
}
