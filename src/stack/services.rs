//! Descriptors for the three services of the stack.

use std::collections::HashMap;

use uuid::Uuid;

use crate::config::StackConfig;
use crate::container::{ContainerDescriptor, WaitStrategy};
use crate::stack::Service;

pub const STORAGE_API_PORT: u16 = 9000;
pub const STORAGE_CONSOLE_PORT: u16 = 9001;
pub const CATALOG_PORT: u16 = 8181;
pub const QUERY_ENGINE_PORT: u16 = 8080;

/// Log line the query engine prints once catalogs are registered.
///
/// Its HTTP endpoint answers before that point, so readiness has to come
/// from the log.
pub const QUERY_ENGINE_READY_LINE: &str = "======== SERVER STARTED ========";

pub const SESSION_LABEL: &str = "icestack.session";
pub const SERVICE_LABEL: &str = "icestack.service";

/// Unique names for one stack instance.
#[derive(Debug, Clone)]
pub struct StackNames {
    session: Uuid,
    prefix: String,
}

impl StackNames {
    pub fn generate() -> Self {
        Self::from_session(Uuid::new_v4())
    }

    pub fn from_session(session: Uuid) -> Self {
        let simple = session.simple().to_string();
        Self {
            session,
            prefix: format!("icestack-{}", &simple[..12]),
        }
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn network(&self) -> String {
        self.prefix.clone()
    }

    pub fn container(&self, service: Service) -> String {
        format!("{}-{}", self.prefix, service.role())
    }

    /// Labels applied to the network (`None`) or a service container.
    pub fn labels(&self, service: Option<Service>) -> HashMap<String, String> {
        let mut labels = HashMap::from([(SESSION_LABEL.to_string(), self.session.to_string())]);
        if let Some(service) = service {
            labels.insert(SERVICE_LABEL.to_string(), service.role().to_string());
        }
        labels
    }
}

fn base(
    config: &StackConfig,
    names: &StackNames,
    service: Service,
    image: &str,
    wait: WaitStrategy,
) -> ContainerDescriptor {
    let mut descriptor = ContainerDescriptor::new(
        names.container(service),
        image,
        names.network(),
        service.alias(),
        wait.with_poll_interval(config.poll_interval),
    );
    for (key, value) in names.labels(Some(service)) {
        descriptor = descriptor.with_label(key, value);
    }
    descriptor
}

/// Object storage (MinIO).
pub fn storage(config: &StackConfig, names: &StackNames) -> ContainerDescriptor {
    let console_address = format!(":{STORAGE_CONSOLE_PORT}");
    base(
        config,
        names,
        Service::Storage,
        &config.storage_image,
        WaitStrategy::http("/minio/health/ready", STORAGE_API_PORT)
            .with_timeout(config.storage_timeout),
    )
    .with_port(STORAGE_API_PORT)
    .with_port(STORAGE_CONSOLE_PORT)
    .with_env("MINIO_ROOT_USER", &config.storage_access_key)
    .with_env("MINIO_ROOT_PASSWORD", config.storage_secret_key())
    .with_env("MINIO_REGION", &config.region)
    .with_cmd(["server", "/data", "--console-address", console_address.as_str()])
}

/// Metadata catalog (Iceberg REST), reaching storage through its alias.
pub fn catalog(config: &StackConfig, names: &StackNames) -> ContainerDescriptor {
    base(
        config,
        names,
        Service::Catalog,
        &config.catalog_image,
        WaitStrategy::http("/v1/config", CATALOG_PORT).with_timeout(config.catalog_timeout),
    )
    .with_port(CATALOG_PORT)
    .with_env("CATALOG_WAREHOUSE", config.warehouse_uri())
    .with_env("CATALOG_IO__IMPL", "org.apache.iceberg.aws.s3.S3FileIO")
    .with_env("CATALOG_S3_ENDPOINT", storage_internal_url())
    .with_env("CATALOG_S3_PATH__STYLE__ACCESS", "true")
    .with_env("AWS_ACCESS_KEY_ID", &config.storage_access_key)
    .with_env("AWS_SECRET_ACCESS_KEY", config.storage_secret_key())
    .with_env("AWS_REGION", &config.region)
}

/// Query engine (Trino) with the catalog definition injected as a file.
pub fn query_engine(config: &StackConfig, names: &StackNames) -> ContainerDescriptor {
    base(
        config,
        names,
        Service::QueryEngine,
        &config.query_engine_image,
        WaitStrategy::log_line(QUERY_ENGINE_READY_LINE).with_timeout(config.query_engine_timeout),
    )
    .with_port(QUERY_ENGINE_PORT)
    .with_resource(
        format!("/etc/trino/catalog/{}.properties", config.catalog),
        catalog_properties(config),
    )
}

fn storage_internal_url() -> String {
    format!("http://{}:{}", Service::Storage.alias(), STORAGE_API_PORT)
}

/// Query-engine catalog file for the REST catalog backed by object storage.
pub fn catalog_properties(config: &StackConfig) -> String {
    let lines = [
        "connector.name=iceberg".to_string(),
        "iceberg.catalog.type=rest".to_string(),
        format!(
            "iceberg.rest-catalog.uri=http://{}:{}",
            Service::Catalog.alias(),
            CATALOG_PORT
        ),
        format!("iceberg.rest-catalog.warehouse={}", config.warehouse_uri()),
        "iceberg.file-format=PARQUET".to_string(),
        "fs.native-s3.enabled=true".to_string(),
        format!("s3.endpoint={}", storage_internal_url()),
        "s3.path-style-access=true".to_string(),
        format!("s3.region={}", config.region),
        format!("s3.aws-access-key={}", config.storage_access_key),
        format!("s3.aws-secret-key={}", config.storage_secret_key()),
    ];
    let mut properties = lines.join("\n");
    properties.push('\n');
    properties
}

/// Idempotent bucket creation, run inside the storage container.
///
/// Credentials come from the container's own environment so they never
/// appear in the argv. The bucket is single-quoted for the shell.
pub fn bootstrap_bucket_argv(bucket: &str) -> Vec<String> {
    let target = shell_quote(&format!("local/{bucket}"));
    let script = format!(
        "mc alias set local http://127.0.0.1:{STORAGE_API_PORT} \"$MINIO_ROOT_USER\" \"$MINIO_ROOT_PASSWORD\" >/dev/null && \
         mc mb --ignore-existing {target}"
    );
    vec!["sh".to_string(), "-c".to_string(), script]
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ReadyCondition;

    #[test]
    fn test_names_are_unique_per_instance() {
        let a = StackNames::generate();
        let b = StackNames::generate();
        assert_ne!(a.network(), b.network());
        assert_ne!(a.container(Service::Storage), b.container(Service::Storage));
        assert!(a.container(Service::QueryEngine).starts_with(&a.network()));
        assert!(a.container(Service::QueryEngine).ends_with("-query-engine"));
    }

    #[test]
    fn test_labels_carry_session_and_role() {
        let names = StackNames::generate();
        let labels = names.labels(Some(Service::Catalog));
        assert_eq!(labels[SESSION_LABEL], names.session().to_string());
        assert_eq!(labels[SERVICE_LABEL], "catalog");
        assert!(!names.labels(None).contains_key(SERVICE_LABEL));
    }

    #[test]
    fn test_query_engine_waits_on_log_line_and_gets_catalog_file() {
        let config = StackConfig::default();
        let descriptor = query_engine(&config, &StackNames::generate());

        assert_eq!(
            descriptor.wait.condition,
            ReadyCondition::LogLine {
                substring: QUERY_ENGINE_READY_LINE.to_string()
            }
        );
        assert_eq!(descriptor.alias, "trino");
        assert_eq!(descriptor.resources.len(), 1);
        assert_eq!(
            descriptor.resources[0].path,
            "/etc/trino/catalog/iceberg.properties"
        );
    }

    #[test]
    fn test_catalog_reaches_storage_by_alias() {
        let config = StackConfig::default();
        let descriptor = catalog(&config, &StackNames::generate());
        assert!(
            descriptor
                .env
                .contains(&("CATALOG_S3_ENDPOINT".to_string(), "http://minio:9000".to_string()))
        );

        let properties = catalog_properties(&config);
        assert!(properties.contains("iceberg.rest-catalog.uri=http://iceberg-rest:8181\n"));
        assert!(properties.contains("iceberg.rest-catalog.warehouse=s3://warehouse/\n"));
    }

    #[test]
    fn test_bootstrap_is_idempotent_command() {
        let argv = bootstrap_bucket_argv("warehouse");
        assert_eq!(argv[..2], ["sh".to_string(), "-c".to_string()]);
        assert!(argv[2].contains("mc mb --ignore-existing 'local/warehouse'"));
        assert!(!argv[2].contains("password"));
    }

    #[test]
    fn test_bucket_is_quoted_for_the_shell() {
        let argv = bootstrap_bucket_argv("x'; touch /tmp/owned #");
        assert!(argv[2].ends_with(r"'local/x'\''; touch /tmp/owned #'"));
        assert_eq!(shell_quote("plain"), "'plain'");
    }
}
