//! Environment Variable Resolution
//!
//! Turns catalog environment definitions plus install-time and user-config
//! values into the container environment of a managed workload.

use super::types::EnvDefinition;
use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

static USER_CONFIG_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{user_config\.([^}]+)\}").expect("placeholder pattern is valid")
});

static LOCALHOST_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(https?://)(?:localhost|127\.0\.0\.1|\[::1\]|::1)([:/?#]|$)")
        .expect("localhost pattern is valid")
});

/// A single container environment entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedEnv {
    /// Value embedded directly in the workload spec
    Literal { name: String, value: String },
    /// Value read from a key of the server's cluster secret
    SecretRef {
        name: String,
        secret_name: String,
        key: String,
    },
}

impl ResolvedEnv {
    pub fn name(&self) -> &str {
        match self {
            ResolvedEnv::Literal { name, .. } | ResolvedEnv::SecretRef { name, .. } => name,
        }
    }
}

/// Inputs to [`resolve_environment`]
#[derive(Debug, Clone, Copy)]
pub struct EnvironmentInputs<'a> {
    /// Catalog definitions, `None` when the server has no catalog metadata
    pub definitions: Option<&'a [EnvDefinition]>,
    /// Values collected at install time for prompted variables
    pub install_values: &'a HashMap<String, String>,
    /// Ad-hoc user configuration
    pub user_config_values: &'a HashMap<String, String>,
    /// Keys the secrets manager already wrote into the cluster secret
    pub stored_secret_keys: &'a BTreeSet<String>,
    /// Cluster secret holding secret-backed values
    pub secret_name: &'a str,
    /// Alias for the developer machine, set only when running outside the cluster
    pub host_alias: Option<&'a str>,
}

/// Replace every `${user_config.KEY}` token, preferring `primary` over `fallback`.
///
/// Unknown keys are left verbatim.
pub fn interpolate_user_config(
    template: &str,
    primary: &HashMap<String, String>,
    fallback: &HashMap<String, String>,
) -> String {
    USER_CONFIG_PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            primary
                .get(key)
                .or_else(|| fallback.get(key))
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Interpolate container arguments: environment values first, then user config
pub fn interpolate_arguments(
    arguments: &[String],
    env_values: &HashMap<String, String>,
    user_config_values: &HashMap<String, String>,
) -> Vec<String> {
    arguments
        .iter()
        .map(|arg| interpolate_user_config(arg, env_values, user_config_values))
        .collect()
}

/// Upper-case a user-config key and map anything outside `[A-Z0-9_]` to `_`
pub fn normalize_env_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            let upper = c.to_ascii_uppercase();
            if upper.is_ascii_uppercase() || upper.is_ascii_digit() || upper == '_' {
                upper
            } else {
                '_'
            }
        })
        .collect()
}

/// Strip one layer of matching surrounding quotes from values longer than one char
pub fn strip_surrounding_quotes(value: &str) -> &str {
    if value.len() > 1 {
        for quote in ['"', '\''] {
            if value.starts_with(quote) && value.ends_with(quote) {
                return &value[1..value.len() - 1];
            }
        }
    }
    value
}

/// Point `http(s)://localhost` style URLs at the developer machine
pub fn rewrite_localhost(value: &str, host_alias: &str) -> String {
    LOCALHOST_URL
        .replace_all(value, |caps: &Captures| {
            format!("{}{}{}", &caps[1], host_alias, &caps[2])
        })
        .into_owned()
}

/// Value of one catalog definition before quote stripping
fn definition_value(
    definition: &EnvDefinition,
    install_values: &HashMap<String, String>,
    user_config_values: &HashMap<String, String>,
) -> Option<String> {
    if definition.prompt_on_installation {
        install_values.get(&definition.key).cloned()
    } else {
        definition
            .value
            .as_deref()
            .map(|raw| interpolate_user_config(raw, install_values, user_config_values))
    }
}

/// Non-empty values of `secret`-typed definitions, keyed like the env references
pub fn secret_values(
    definitions: &[EnvDefinition],
    install_values: &HashMap<String, String>,
    user_config_values: &HashMap<String, String>,
) -> BTreeMap<String, String> {
    definitions
        .iter()
        .filter(|definition| definition.is_secret())
        .filter_map(|definition| {
            definition_value(definition, install_values, user_config_values)
                .filter(|value| !value.is_empty())
                .map(|value| (definition.key.clone(), value))
        })
        .collect()
}

/// Produce the final container environment
///
/// Secret-typed definitions and stored secret keys always become references
/// to the cluster secret, never literal values.
pub fn resolve_environment(inputs: EnvironmentInputs<'_>) -> Vec<ResolvedEnv> {
    let mut values: Vec<(String, String)> = Vec::new();
    let mut secret_keys: Vec<String> = inputs.stored_secret_keys.iter().cloned().collect();

    match inputs.definitions {
        Some(definitions) => {
            for definition in definitions {
                if definition.is_secret() && !secret_keys.contains(&definition.key) {
                    secret_keys.push(definition.key.clone());
                }

                let value = definition_value(
                    definition,
                    inputs.install_values,
                    inputs.user_config_values,
                );

                match value {
                    Some(value) => upsert(&mut values, &definition.key, value),
                    // keep a placeholder so the secret key can still be mounted
                    None if definition.is_secret() => {
                        upsert(&mut values, &definition.key, String::new())
                    }
                    None => {}
                }
            }
        }
        None => {
            let mut adhoc: Vec<_> = inputs.install_values.iter().collect();
            adhoc.sort();
            for (key, value) in adhoc {
                upsert(&mut values, key, value.clone());
            }
        }
    }

    let mut user_config: Vec<_> = inputs.user_config_values.iter().collect();
    user_config.sort();
    for (key, value) in user_config {
        let key = normalize_env_key(key);
        if !values.iter().any(|(existing, _)| *existing == key) {
            values.push((key, value.clone()));
        }
    }

    values
        .into_iter()
        .filter_map(|(name, value)| {
            if secret_keys.contains(&name) {
                // no secret key was written for empty values
                if value.is_empty() {
                    return None;
                }
                return Some(ResolvedEnv::SecretRef {
                    key: name.clone(),
                    name,
                    secret_name: inputs.secret_name.to_string(),
                });
            }

            let stripped = strip_surrounding_quotes(&value);
            let value = match inputs.host_alias {
                Some(alias) => rewrite_localhost(stripped, alias),
                None => stripped.to_string(),
            };
            Some(ResolvedEnv::Literal { name, value })
        })
        .collect()
}

fn upsert(values: &mut Vec<(String, String)>, key: &str, value: String) {
    match values.iter_mut().find(|(existing, _)| existing == key) {
        Some(entry) => entry.1 = value,
        None => values.push((key.to_string(), value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::types::EnvVarType;

    static NO_STORED_KEYS: BTreeSet<String> = BTreeSet::new();

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn definition(key: &str, type_: EnvVarType, value: Option<&str>, prompt: bool) -> EnvDefinition {
        EnvDefinition {
            key: key.to_string(),
            type_,
            value: value.map(String::from),
            prompt_on_installation: prompt,
            required: None,
            description: None,
        }
    }

    fn inputs<'a>(
        definitions: Option<&'a [EnvDefinition]>,
        install: &'a HashMap<String, String>,
        user: &'a HashMap<String, String>,
    ) -> EnvironmentInputs<'a> {
        EnvironmentInputs {
            definitions,
            install_values: install,
            user_config_values: user,
            stored_secret_keys: &NO_STORED_KEYS,
            secret_name: "mcp-server-s1-secrets",
            host_alias: None,
        }
    }

    #[test]
    fn test_argument_interpolation_precedence() {
        let args = vec!["--root=${user_config.foo}".to_string()];

        let env = map(&[("foo", "from-env")]);
        let user = map(&[("foo", "from-user")]);
        assert_eq!(interpolate_arguments(&args, &env, &user), vec!["--root=from-env"]);

        let empty = HashMap::new();
        assert_eq!(interpolate_arguments(&args, &empty, &user), vec!["--root=from-user"]);

        assert_eq!(
            interpolate_arguments(&args, &empty, &empty),
            vec!["--root=${user_config.foo}"]
        );
    }

    #[test]
    fn test_quote_stripping() {
        assert_eq!(strip_surrounding_quotes("'value'"), "value");
        assert_eq!(strip_surrounding_quotes("\"value\""), "value");
        assert_eq!(strip_surrounding_quotes("'"), "'");
        assert_eq!(strip_surrounding_quotes("\"mixed'"), "\"mixed'");
        assert_eq!(strip_surrounding_quotes("''"), "");
    }

    #[test]
    fn test_rewrite_localhost() {
        let alias = "host.docker.internal";
        assert_eq!(
            rewrite_localhost("http://localhost:3000/api", alias),
            "http://host.docker.internal:3000/api"
        );
        assert_eq!(
            rewrite_localhost("https://127.0.0.1", alias),
            "https://host.docker.internal"
        );
        assert_eq!(
            rewrite_localhost("http://[::1]:8080", alias),
            "http://host.docker.internal:8080"
        );
        assert_eq!(
            rewrite_localhost("http://localhost.example.com", alias),
            "http://localhost.example.com"
        );
    }

    #[test]
    fn test_normalize_env_key() {
        assert_eq!(normalize_env_key("api-key"), "API_KEY");
        assert_eq!(normalize_env_key("root.path"), "ROOT_PATH");
    }

    #[test]
    fn test_secret_backed_empty_value_is_skipped() {
        let defs = vec![definition("API_KEY", EnvVarType::Secret, None, true)];
        let empty = HashMap::new();

        let env = resolve_environment(inputs(Some(&defs), &empty, &empty));
        assert!(env.is_empty());
    }

    #[test]
    fn test_secret_backed_value_is_a_reference() {
        let defs = vec![definition("API_KEY", EnvVarType::Secret, None, true)];
        let install = map(&[("API_KEY", "sk-123")]);
        let empty = HashMap::new();

        let env = resolve_environment(inputs(Some(&defs), &install, &empty));
        assert_eq!(
            env,
            vec![ResolvedEnv::SecretRef {
                name: "API_KEY".to_string(),
                secret_name: "mcp-server-s1-secrets".to_string(),
                key: "API_KEY".to_string(),
            }]
        );
    }

    #[test]
    fn test_static_value_interpolated_and_stripped() {
        let defs = vec![
            definition("ROOT", EnvVarType::PlainText, Some("'${user_config.dir}'"), false),
            definition("UNSET", EnvVarType::PlainText, None, true),
        ];
        let empty = HashMap::new();
        let user = map(&[("dir", "/data")]);

        let env = resolve_environment(inputs(Some(&defs), &empty, &user));
        assert_eq!(
            env[0],
            ResolvedEnv::Literal {
                name: "ROOT".to_string(),
                value: "/data".to_string(),
            }
        );
        // user config is layered in under a normalized key
        assert_eq!(env[1].name(), "DIR");
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_adhoc_values_without_catalog() {
        let install = map(&[("B", "2"), ("A", "1")]);
        let empty = HashMap::new();

        let env = resolve_environment(inputs(None, &install, &empty));
        let names: Vec<_> = env.iter().map(ResolvedEnv::name).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn test_stored_secret_keys_are_references_without_catalog() {
        let install = map(&[("DB_PASSWORD", "hunter2"), ("REGION", "eu")]);
        let empty = HashMap::new();
        let stored: BTreeSet<String> = ["DB_PASSWORD".to_string()].into();

        let mut adhoc = inputs(None, &install, &empty);
        adhoc.stored_secret_keys = &stored;
        let env = resolve_environment(adhoc);

        assert_eq!(
            env,
            vec![
                ResolvedEnv::SecretRef {
                    name: "DB_PASSWORD".to_string(),
                    secret_name: "mcp-server-s1-secrets".to_string(),
                    key: "DB_PASSWORD".to_string(),
                },
                ResolvedEnv::Literal {
                    name: "REGION".to_string(),
                    value: "eu".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_stored_secret_key_overrides_plain_definition() {
        let defs = vec![definition("TOKEN", EnvVarType::PlainText, None, true)];
        let install = map(&[("TOKEN", "t-1")]);
        let empty = HashMap::new();
        let stored: BTreeSet<String> = ["TOKEN".to_string()].into();

        let mut catalog = inputs(Some(&defs), &install, &empty);
        catalog.stored_secret_keys = &stored;
        let env = resolve_environment(catalog);

        assert!(matches!(&env[..], [ResolvedEnv::SecretRef { key, .. }] if key == "TOKEN"));
    }

    #[test]
    fn test_catalog_value_wins_over_user_config_key() {
        let defs = vec![definition("PORT", EnvVarType::PlainText, Some("80"), false)];
        let empty = HashMap::new();
        let user = map(&[("port", "9999")]);

        let env = resolve_environment(inputs(Some(&defs), &empty, &user));
        assert_eq!(
            env,
            vec![ResolvedEnv::Literal {
                name: "PORT".to_string(),
                value: "80".to_string(),
            }]
        );
    }

    #[test]
    fn test_localhost_rewrite_only_outside_cluster() {
        let defs = vec![definition(
            "API_URL",
            EnvVarType::PlainText,
            Some("http://localhost:9000"),
            false,
        )];
        let empty = HashMap::new();

        let mut local = inputs(Some(&defs), &empty, &empty);
        local.host_alias = Some("host.docker.internal");
        let env = resolve_environment(local);
        assert_eq!(
            env[0],
            ResolvedEnv::Literal {
                name: "API_URL".to_string(),
                value: "http://host.docker.internal:9000".to_string(),
            }
        );

        let env = resolve_environment(inputs(Some(&defs), &empty, &empty));
        assert_eq!(
            env[0],
            ResolvedEnv::Literal {
                name: "API_URL".to_string(),
                value: "http://localhost:9000".to_string(),
            }
        );
    }

    #[test]
    fn test_secret_values_match_references() {
        let defs = vec![
            definition("API_KEY", EnvVarType::Secret, None, true),
            definition("EMPTY", EnvVarType::Secret, None, true),
            definition("REGION", EnvVarType::PlainText, Some("eu"), false),
        ];
        let install = map(&[("API_KEY", "sk-123"), ("EMPTY", "")]);
        let empty = HashMap::new();

        let secrets = secret_values(&defs, &install, &empty);
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets["API_KEY"], "sk-123");
    }
}
