use std::collections::BTreeMap;

use fitdash_adapters::{ApiArgs, ConnectorRegistry, ServiceConnector, ServicesFile};
use fitdash_storage::{HttpClientConfig, HttpFetcher};

fn workspace_services() -> ServicesFile {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    ServicesFile::load(root.join("services.yaml")).unwrap()
}

#[test]
fn workspace_services_file_registers_every_service() {
    let file = workspace_services();
    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
    let registry = ConnectorRegistry::from_services(&file, &http);

    let mut services = registry.services();
    services.sort_unstable();
    assert_eq!(services, vec!["Garmin", "Spotify"]);

    let by_login = registry
        .resolve("ignored", Some("backend_functions.garmin_functions.garmin_login"))
        .unwrap();
    assert_eq!(by_login.service(), "Garmin");
    assert_eq!(by_login.probe_after().as_secs(), 300);

    let spotify = registry.resolve("spotify", None).unwrap();
    assert_eq!(spotify.max_session_age().map(|d| d.as_secs()), Some(1800));
}

#[test]
fn garmin_paths_take_the_display_name_credential() {
    let file = workspace_services();
    let garmin = file.services.iter().find(|s| s.name == "Garmin").unwrap();
    let function = &garmin.functions["get_sleep_data"];
    let context = BTreeMap::from([("display_name".to_string(), "runner42".to_string())]);
    let args = ApiArgs {
        positional: vec!["2026-05-01".into()],
        named: BTreeMap::new(),
    };

    let (path, query) = function
        .resolve(&garmin.name, "get_sleep_data", &args, &context)
        .unwrap();
    assert_eq!(path, "/wellness-service/wellness/dailySleepData/runner42");
    assert_eq!(query, vec![("date".to_string(), "2026-05-01".to_string())]);
}
