//! Three-layer precedence for configuration values.

/// Pick the effective value: task override, then mode value, then global.
#[must_use]
pub fn resolve<T>(task_override: Option<T>, mode_value: Option<T>, global_value: Option<T>) -> Option<T> {
    task_override.or(mode_value).or(global_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_override_wins() {
        assert_eq!(resolve(Some("x"), Some("y"), Some("z")), Some("x"));
    }

    #[test]
    fn mode_value_beats_global() {
        assert_eq!(resolve(None, Some("y"), Some("z")), Some("y"));
    }

    #[test]
    fn global_is_the_fallback() {
        assert_eq!(resolve(None, None, Some("z")), Some("z"));
    }

    #[test]
    fn nothing_set_resolves_to_none() {
        assert_eq!(resolve::<u32>(None, None, None), None);
    }

    #[test]
    fn task_override_applies_without_lower_layers() {
        assert_eq!(resolve(Some(7), None, None), Some(7));
    }
}
