use heck::{ToKebabCase, ToLowerCamelCase, ToPascalCase, ToShoutySnakeCase, ToSnakeCase};
use minijinja::Environment;
use uuid::Uuid;

/// Name the deterministic v5 uuids are derived under.
const UUID_NAMESPACE_NAME: &str = "freight.templates";

/// Registers the case conversion filters and the uuid helper on `env`.
pub fn register(env: &mut Environment<'_>) {
    env.add_filter("camelcase", camelcase);
    env.add_filter("pascalcase", pascalcase);
    env.add_filter("snakecase", snakecase);
    env.add_filter("kebabcase", kebabcase);
    env.add_filter("screamingsnakecase", screamingsnakecase);
    env.add_filter("uuid_generate", uuid_generate);
    env.add_function("uuid_generate", uuid_generate);
}

pub fn camelcase(s: String) -> String {
    s.to_lower_camel_case()
}

pub fn pascalcase(s: String) -> String {
    s.to_pascal_case()
}

pub fn snakecase(s: String) -> String {
    s.to_snake_case()
}

pub fn kebabcase(s: String) -> String {
    s.to_kebab_case()
}

pub fn screamingsnakecase(s: String) -> String {
    s.to_shouty_snake_case()
}

/// Random v4 uuid without input, deterministic v5 uuid for a non-empty
/// string, so a page slug always maps to the same id across runs.
pub fn uuid_generate(val: Option<String>) -> String {
    let namespace = Uuid::new_v5(&Uuid::NAMESPACE_DNS, UUID_NAMESPACE_NAME.as_bytes());
    match val {
        Some(s) if !s.is_empty() => Uuid::new_v5(&namespace, s.as_bytes()).to_string(),
        _ => Uuid::new_v4().to_string(),
    }
}
