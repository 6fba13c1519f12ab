use super::*;

use std::io::Write;

use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;

fn light() -> Command {
    Command {
        topic: "home/light/set".to_string(),
        options: HashMap::from([
            ("on".to_string(), "1".to_string()),
            ("off".to_string(), String::new()),
        ]),
    }
}

fn table_file(suffix: &str, content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_resolve_option_value() {
    assert_eq!(light().resolve_message(Some("on"), None), "1");
    assert_eq!(light().resolve_message(Some("on"), Some("x")), "1");
}

#[test]
fn test_resolve_falls_back_to_body_message() {
    assert_eq!(light().resolve_message(Some("dim"), Some("x")), "x");
}

#[test]
fn test_resolve_falls_back_to_message() {
    assert_eq!(light().resolve_message(Some("dim"), None), "dim");
    // Empty option values do not count
    assert_eq!(light().resolve_message(Some("off"), None), "off");
}

#[test]
fn test_resolve_nothing() {
    assert_eq!(light().resolve_message(None, None), "");
    assert_eq!(light().resolve_message(Some(""), Some("")), "");
}

#[test]
fn test_parse_yaml_table() {
    let yaml = r#"
light:
  topic: home/light/set
  options:
    "on": "1"
    level: 42
    enabled: true
door:
  topic: home/door
"#;
    let table = parse_table(yaml, FileFormat::Yaml).unwrap();
    assert_eq!(table.len(), 2);

    let light = &table["light"];
    assert_eq!(light.topic, "home/light/set");
    assert_eq!(light.options["on"], "1");
    assert_eq!(light.options["level"], "42");
    assert_eq!(light.options["enabled"], "true");
    assert!(table["door"].options.is_empty());
}

#[test]
fn test_parse_json_table() {
    let json = r#"{"fan": {"topic": "home/fan", "options": {"high": "3"}}}"#;
    let table = parse_table(json, FileFormat::Json).unwrap();
    assert_eq!(table["fan"].options["high"], "3");
}

#[test]
fn test_parse_empty_table() {
    assert!(parse_table("  \n", FileFormat::Yaml).unwrap().is_empty());
}

#[test]
fn test_parse_rejects_missing_topic() {
    let yaml = "light:\n  options:\n    dim: \"1\"\n";
    assert!(parse_table(yaml, FileFormat::Yaml).is_err());
}

#[tokio::test]
async fn test_file_table_lookup() {
    let file = table_file(
        ".yml",
        "light:\n  topic: home/light/set\n  options:\n    \"on\": \"1\"\n",
    );
    let table = FileCommandTable::new(file.path());

    let command = table.lookup("light").await.unwrap().unwrap();
    assert_eq!(command.topic, "home/light/set");
    assert_eq!(table.lookup("missing").await.unwrap(), None);
}

#[tokio::test]
async fn test_file_table_reread_on_every_lookup() {
    let file = table_file(".yml", "a:\n  topic: first\n");
    let table = FileCommandTable::new(file.path());
    assert_eq!(table.lookup("a").await.unwrap().unwrap().topic, "first");

    std::fs::write(file.path(), "a:\n  topic: second\n").unwrap();
    assert_eq!(table.lookup("a").await.unwrap().unwrap().topic, "second");
}

#[tokio::test]
async fn test_file_table_toml() {
    let file = table_file(".toml", "[pump]\ntopic = \"garden/pump\"\n[pump.options]\non = 1\n");
    let table = FileCommandTable::new(file.path());
    let command = table.lookup("pump").await.unwrap().unwrap();
    assert_eq!(command.options["on"], "1");
}

#[tokio::test]
async fn test_file_table_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let table = FileCommandTable::new(dir.path().join("commands.yml"));
    assert!(matches!(
        table.lookup("a").await,
        Err(CommandError::Io(_, _))
    ));
}

#[tokio::test]
async fn test_file_table_invalid_content() {
    let file = table_file(".json", "{not json");
    let table = FileCommandTable::new(file.path());
    assert!(matches!(
        table.lookup("a").await,
        Err(CommandError::Parse(_, _))
    ));
}

#[tokio::test]
async fn test_file_table_unsupported_extension() {
    let file = table_file(".ini", "a=b");
    let table = FileCommandTable::new(file.path());
    assert!(matches!(
        table.lookup("a").await,
        Err(CommandError::UnsupportedFormat(_))
    ));
}

#[tokio::test]
async fn test_static_table() {
    let table = StaticCommandTable::new().with("light", light());
    assert_eq!(table.lookup("light").await.unwrap(), Some(light()));
    assert_eq!(table.lookup("fan").await.unwrap(), None);
}
