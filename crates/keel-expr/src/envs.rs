//! Environments for the policy expressions evaluated by controllers.

use crate::env::Env;

/// Cgroup classes, in the order used by the ranking constants.
pub const CGROUP_CLASSES: &[(&str, i64)] = &[
    ("Besteffort", 0),
    ("Burstable", 1),
    ("Guaranteed", 2),
    ("Podruntime", 3),
    ("System", 4),
];

/// PSI keys sampled from `memory.pressure`.
pub const PSI_KEYS: &[&str] = &[
    "memory_some_avg10",
    "memory_some_avg60",
    "memory_some_avg300",
    "memory_some_total",
    "memory_full_avg10",
    "memory_full_avg60",
    "memory_full_avg300",
    "memory_full_total",
];

/// Default OOM trigger.
pub const DEFAULT_OOM_TRIGGER: &str = r#"memory_full_avg10 > 12.0 && time_since_trigger > duration("500ms")"#;

/// Default cgroup ranking: class dominates, then the smallest limit headroom.
///
/// Pod runtime and system cgroups score zero and are never selected.
pub const DEFAULT_OOM_CGROUP_RANKING: &str = "{Besteffort: 3.0, Burstable: 2.0, Guaranteed: 1.0, Podruntime: 0.0, System: 0.0}[class] \
     * (1e13 + double(memory_current.orValue(0u)) - double(memory_max.orValue(0u)))";

/// Default image cache volume locator for the ISO volume.
pub const DEFAULT_IMAGE_CACHE_ISO_LOCATOR: &str =
    r#"volume.label.startsWith("IMAGECACHE") && (volume.name == "iso9660" || volume.name == "vfat")"#;

/// Default image cache volume locator for the disk partition.
pub const DEFAULT_IMAGE_CACHE_DISK_LOCATOR: &str = r#"volume.partition_label == "IMAGECACHE""#;

fn with_classes(mut env: Env) -> Env {
    for (name, value) in CGROUP_CLASSES {
        env = env.constant(*name, *value);
    }
    env
}

/// Variables available to the OOM trigger expression.
///
/// Root PSI values (`memory_full_avg10`, ...), their per-second deltas
/// (`d_memory_full_avg10`, ...), per-class maps of both (`qos_memory_full_avg10`,
/// `d_qos_memory_full_avg10`, keyed by class), per-class memory maps
/// (`qos_memory_current`, `qos_memory_max`, `qos_memory_peak` and their
/// `d_` deltas) and `time_since_trigger`.
pub fn oom_trigger() -> Env {
    let mut names = Vec::new();
    for key in PSI_KEYS {
        names.push(key.to_string());
        names.push(format!("d_{key}"));
        names.push(format!("qos_{key}"));
        names.push(format!("d_qos_{key}"));
    }
    for name in ["qos_memory_current", "qos_memory_max", "qos_memory_peak"] {
        names.push(name.to_string());
        names.push(format!("d_{name}"));
    }
    names.push("time_since_trigger".to_string());

    with_classes(Env::new().variables(names).with_size_units())
}

/// Variables available to the cgroup ranking expression: `path`, `class`
/// and the optional `memory_current`, `memory_max` and `memory_peak`.
pub fn oom_cgroup_ranking() -> Env {
    with_classes(
        Env::new()
            .variables(["path", "class", "memory_current", "memory_max", "memory_peak"])
            .with_size_units(),
    )
}

/// Variables available to volume locators: `volume`, a map of the
/// discovered volume's attributes.
pub fn volume_locator() -> Env {
    Env::new().variable("volume").with_size_units()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Activation, Expression, Value};
    use std::time::Duration;

    fn ranking(class: i64, current: Option<u64>, max: Option<u64>) -> f64 {
        let env = oom_cgroup_ranking();
        let expr = Expression::compile(DEFAULT_OOM_CGROUP_RANKING, &env).unwrap();
        let act = Activation::new()
            .bind("path", "/sys/fs/cgroup/x")
            .bind("class", class)
            .bind("memory_current", current)
            .bind("memory_max", max)
            .bind("memory_peak", None::<u64>);
        expr.eval_double(&env, &act).unwrap()
    }

    #[test]
    fn test_defaults_compile() {
        Expression::compile(DEFAULT_OOM_TRIGGER, &oom_trigger()).unwrap();
        Expression::compile(DEFAULT_OOM_CGROUP_RANKING, &oom_cgroup_ranking()).unwrap();
        Expression::compile(DEFAULT_IMAGE_CACHE_ISO_LOCATOR, &volume_locator()).unwrap();
        Expression::compile(DEFAULT_IMAGE_CACHE_DISK_LOCATOR, &volume_locator()).unwrap();
    }

    #[test]
    fn test_ranking_orders_classes() {
        let besteffort = ranking(0, Some(10 << 20), None);
        let burstable = ranking(1, Some(900 << 20), Some(1 << 30));
        let guaranteed = ranking(2, Some(4 << 30), Some(4 << 30));
        assert!(besteffort > burstable);
        assert!(burstable > guaranteed);
        assert!(guaranteed > 0.0);
        assert_eq!(ranking(3, Some(1 << 30), None), 0.0);
        assert_eq!(ranking(4, Some(1 << 30), None), 0.0);
    }

    #[test]
    fn test_ranking_prefers_less_headroom() {
        let tight = ranking(1, Some(990 << 20), Some(1 << 30));
        let loose = ranking(1, Some(100 << 20), Some(1 << 30));
        assert!(tight > loose);
    }

    #[test]
    fn test_trigger() {
        let env = oom_trigger();
        let expr = Expression::compile(DEFAULT_OOM_TRIGGER, &env).unwrap();

        let act = |pressure: f64, since: Duration| {
            Activation::new()
                .bind("memory_full_avg10", pressure)
                .bind("time_since_trigger", since)
        };

        assert!(expr.eval_bool(&env, &act(20.0, Duration::from_secs(5))).unwrap());
        assert!(!expr.eval_bool(&env, &act(5.0, Duration::from_secs(5))).unwrap());
        assert!(!expr.eval_bool(&env, &act(20.0, Duration::from_millis(100))).unwrap());
    }

    #[test]
    fn test_iso_locator() {
        let env = volume_locator();
        let expr = Expression::compile(DEFAULT_IMAGE_CACHE_ISO_LOCATOR, &env).unwrap();
        let volume = |name: &str, label: &str| {
            Activation::new().bind("volume", Value::map([("name", Value::from(name)), ("label", Value::from(label))]))
        };
        assert!(expr.eval_bool(&env, &volume("iso9660", "IMAGECACHE")).unwrap());
        assert!(expr.eval_bool(&env, &volume("vfat", "IMAGECACHE-2")).unwrap());
        assert!(!expr.eval_bool(&env, &volume("xfs", "IMAGECACHE")).unwrap());
        assert!(!expr.eval_bool(&env, &volume("iso9660", "METAL")).unwrap());
    }
}
