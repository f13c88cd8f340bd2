fn expand_with_home(value: &str, home: Option<&Path>) -> PathBuf {
    match home {
        Some(home) if value == "~" => home.to_path_buf(),
        Some(home) => match value.strip_prefix("~/") {
            Some(rest) => home.join(rest),
            None => PathBuf::from(value),
        },
        None => PathBuf::from(value),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_required<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    non_blank(lookup(name)).ok_or(ConfigError::Missing(name))
}

fn read_dir<F>(lookup: &F, name: &'static str, home: Option<&Path>) -> Result<PathBuf, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    read_required(lookup, name).map(|value| expand_with_home(&value, home))
}

fn read_string<F>(lookup: &F, name: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    non_blank(lookup(name)).unwrap_or_else(|| default.to_string())
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    non_blank(lookup(name))
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match non_blank(lookup(name)) {
        Some(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

fn ensure_distinct(dirs: &[&PathBuf]) -> Result<(), ConfigError> {
    let normalized: Vec<PathBuf> = dirs
        .iter()
        .map(|dir| dir.components().collect::<PathBuf>())
        .collect();
    for (index, dir) in normalized.iter().enumerate() {
        if normalized[index + 1..].contains(dir) {
            return Err(ConfigError::SameDirectories);
        }
    }
    Ok(())
}
