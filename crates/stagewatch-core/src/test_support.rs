use chrono::{TimeZone, Utc};
use stagewatch_protocol::{AbortPromotionRequest, Promotion, ANNOTATION_ABORT};

pub fn abort_annotation() -> (&'static str, String) {
    let value = serde_json::to_string(&AbortPromotionRequest::terminate()).expect("encode abort");
    (ANNOTATION_ABORT, value)
}

/// Promotion in project `demo`, stage `prod`, created `secs` after the epoch.
pub fn promo(name: &str, secs: i64) -> Promotion {
    Promotion::new("demo", name)
        .with_stage("prod")
        .with_freight(format!("{name}-freight-0001"))
        .with_created_at(Utc.timestamp_opt(secs, 0).unwrap())
}

pub fn names(list: &[Promotion]) -> Vec<&str> {
    list.iter().map(|p| p.metadata.name.as_str()).collect()
}

pub mod env {
    use once_cell::sync::Lazy;
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    pub struct EnvGuard {
        _lock: MutexGuard<'static, ()>,
        saved: Vec<(&'static str, Option<String>)>,
    }

    pub fn guard() -> EnvGuard {
        EnvGuard {
            _lock: ENV_LOCK
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
            saved: Vec::new(),
        }
    }

    impl EnvGuard {
        fn remember(&mut self, key: &'static str) {
            if self.saved.iter().any(|(k, _)| *k == key) {
                return;
            }
            self.saved.push((key, std::env::var(key).ok()));
        }
        pub fn set(&mut self, key: &'static str, value: &str) {
            self.remember(key);
            std::env::set_var(key, value);
        }
        pub fn remove(&mut self, key: &'static str) {
            self.remember(key);
            std::env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, val) in self.saved.drain(..) {
                match val {
                    Some(v) => std::env::set_var(key, v),
                    None => std::env::remove_var(key),
                }
            }
        }
    }
}
