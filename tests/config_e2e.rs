use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;

use sequencing::{
    from_fn, ConfigurationError, EventKind, InMemoryBinaryStore, InMemoryContentStore, JobState,
    PropertyValue, RawNotification, SequencerCatalog, SequencerDefinition, SequencingError, SequencingService,
    ServiceConfig, SessionHandle,
};

const CONFIG: &str = r#"{
    "worker_count": 2,
    "queue_capacity": 64,
    "overflow": { "policy": "skip" },
    "sequencers": [
        {
            "name": "image-metadata",
            "description": "Extracts image dimensions",
            "path_expressions": ["/images/**/*.png@data", "/uploads/*.png@data"],
            "sequencer": "stamp",
            "properties": { "label": "png", "formats": ["png", "apng"], "limit": 10 }
        },
        {
            "name": "archive-copy",
            "path_expressions": ["{archive}/**@data => /copies$0"],
            "sequencer": "stamp"
        }
    ]
}"#;

fn catalog() -> SequencerCatalog {
    SequencerCatalog::new().with(
        "stamp",
        from_fn(|ctx| {
            let label = ctx
                .config_property("label")
                .and_then(PropertyValue::as_string)
                .unwrap_or("none")
                .to_string();
            ctx.write_output("stamp", label)?;
            Ok(())
        }),
    )
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn service_runs_from_config_file() {
    let file = write_config(CONFIG);
    let config = ServiceConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.worker_count, 2);
    assert_eq!(config.sequencers.len(), 2);

    let content = InMemoryContentStore::new();
    content.create_workspace("archive");
    let service = SequencingService::from_config(
        config,
        &catalog(),
        Arc::new(content.clone()),
        Arc::new(InMemoryBinaryStore::new()),
    )
    .unwrap();

    let summaries = service.sequencers().unwrap();
    assert_eq!(summaries[0].name, "image-metadata");
    assert_eq!(summaries[0].description, "Extracts image dimensions");
    assert_eq!(summaries[1].name, "archive-copy");

    let outcomes = service.subscribe().unwrap();
    service.start().unwrap();

    let report = service.notify(RawNotification::property(
        EventKind::Added,
        "/images/2024/cat.png",
        "data",
        SessionHandle::new("default"),
    ));
    assert_eq!(report.queued, 1);

    // Same path in another workspace only matches the workspace-scoped rule.
    let report = service.notify(RawNotification::property(
        EventKind::Changed,
        "/docs/a",
        "data",
        SessionHandle::new("archive").with_session_id("s-1"),
    ));
    assert_eq!(report.queued, 1);

    for _ in 0..2 {
        let outcome = outcomes.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.state, JobState::Completed);
    }
    service.shutdown().unwrap();

    assert_eq!(
        content.property("default", "/images/2024/cat.png", "stamp"),
        Some(PropertyValue::from("png"))
    );
    assert_eq!(
        content.property("archive", "/copies/docs/a", "stamp"),
        Some(PropertyValue::from("none"))
    );
}

#[test]
fn field_listing_is_explicit() {
    let config = ServiceConfig::from_json_str(CONFIG).unwrap();
    let service = SequencingService::from_config(
        config,
        &catalog(),
        Arc::new(InMemoryContentStore::new()),
        Arc::new(InMemoryBinaryStore::new()),
    )
    .unwrap();

    let fields = service.sequencer_fields("image-metadata").unwrap();
    let lookup = |name: &str| {
        fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.clone())
            .unwrap()
    };
    assert_eq!(lookup("name"), "image-metadata");
    assert_eq!(lookup("path_expressions.0"), "/images/**/*.png@data");
    assert_eq!(lookup("path_expressions.1"), "/uploads/*.png@data");
    assert!(fields.iter().all(|f| f.name != "path_expressions.2"));
    assert_eq!(lookup("sequencer"), "stamp");
    assert_eq!(lookup("properties.formats"), "png apng");
    assert_eq!(lookup("properties.limit"), "10");
}

#[test]
fn invalid_expression_in_file_fails_fast() {
    let file = write_config(
        r#"{"sequencers": [{"name": "bad", "path_expressions": ["images/*"], "sequencer": "stamp"}]}"#,
    );
    let config = ServiceConfig::from_json_file(file.path()).unwrap();
    let err = SequencingService::from_config(
        config,
        &catalog(),
        Arc::new(InMemoryContentStore::new()),
        Arc::new(InMemoryBinaryStore::new()),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        SequencingError::Configuration(ConfigurationError::InvalidPathExpression { .. })
    ));
}

#[test]
fn missing_file_is_unreadable() {
    let dir = tempfile::tempdir().unwrap();
    let err = ServiceConfig::from_json_file(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, ConfigurationError::Unreadable { .. }));
}

#[test]
fn definitions_can_be_registered_at_runtime() {
    let service = SequencingService::new(
        ServiceConfig::default(),
        Arc::new(InMemoryContentStore::new()),
        Arc::new(InMemoryBinaryStore::new()),
    )
    .unwrap();
    let def: SequencerDefinition = serde_json::from_str(
        r#"{"name": "late", "path_expressions": ["/late/*"], "sequencer": "stamp"}"#,
    )
    .unwrap();

    service.register_definition(&def, &catalog()).unwrap();
    let err = service.register_definition(&def, &catalog()).unwrap_err();
    assert!(matches!(
        err,
        SequencingError::Configuration(ConfigurationError::DuplicateSequencer { .. })
    ));
}
