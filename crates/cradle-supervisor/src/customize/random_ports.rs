use std::collections::BTreeMap;

use anyhow::Context;
use cradle_launch::{JvmOptionsMode, PortAssignment, PortRole};
use tracing::debug;

use super::jvm_options::{apply_jvm_options, set_env_jmx_port};
use super::main_config::upsert_yaml_keys;
use super::{FileCustomizer, Staging, rewrite};
use crate::port_alloc::PortAllocator;

/// Give every port still at `0` a fresh ephemeral port.
pub fn resolve_unset_ports(
    ports: &mut PortAssignment,
    allocator: &mut PortAllocator,
) -> anyhow::Result<()> {
    let unset: Vec<PortRole> = ports
        .roles()
        .filter(|(_, port)| *port == 0)
        .map(|(role, _)| role)
        .collect();
    for role in unset {
        let port = allocator
            .allocate()
            .with_context(|| format!("allocate {role} port"))?;
        ports.set(role, port);
    }
    Ok(())
}

/// Re-resolves every port through the allocator when random ports are requested.
pub struct RandomPortCustomizer;

impl FileCustomizer for RandomPortCustomizer {
    fn name(&self) -> &'static str {
        "random-ports"
    }

    fn customize(&self, staging: &mut Staging<'_>) -> anyhow::Result<()> {
        if !staging.ctx.executable.use_random_ports {
            return Ok(());
        }

        for role in PortAssignment::REQUIRED {
            staging.ports.set(role, 0);
        }
        // Only zeroed when present; an absent ssl native port stays absent.
        staging.ports.set(PortRole::NativeTransportSsl, 0);
        resolve_unset_ports(&mut staging.ports, staging.allocator)?;
        debug!(launch = %staging.ctx.id, ports = ?staging.ports, "random ports assigned");

        let thrift = staging.ctx.distribution.version.major < 4;
        let values: BTreeMap<String, String> = staging
            .ports
            .roles()
            .filter(|(role, _)| thrift || *role != PortRole::Rpc)
            .filter_map(|(role, port)| role.yaml_key().map(|k| (k.to_string(), port.to_string())))
            .collect();
        rewrite(&staging.work.config_file(), |content| {
            upsert_yaml_keys(content, &values)
        })?;

        let props = staging.system_properties();
        if let Some(path) = staging.work.jvm_options_file() {
            rewrite(&path, |content| {
                apply_jvm_options(content, &props, JvmOptionsMode::Replace)
            })?;
        }
        if let Some(script) = staging.work.env_script(staging.ctx.distribution.os) {
            let jmx = staging.ports.jmx;
            rewrite(&script, |content| set_env_jmx_port(content, jmx))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use cradle_launch::{Config, OsFamily};

    use super::super::test_support::*;
    use super::super::{Staging, WorkDir};
    use super::*;

    fn zeroed_config() -> Config {
        Config {
            native_transport_port: 0,
            rpc_port: 0,
            storage_port: 0,
            ssl_storage_port: 0,
            jmx_port: 0,
            native_transport_port_ssl: None,
            ..Config::default()
        }
    }

    fn run(config: Config, random: bool) -> (PortAssignment, WorkDir, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let files = fake_distribution(tmp.path(), OsFamily::Linux);
        let mut ctx = context(files, OsFamily::Linux, "3.11.6");
        ctx.config = config;
        ctx.executable.use_random_ports = random;
        let work = WorkDir::stage(&ctx.files, &tmp.path().join("work")).unwrap();
        let mut alloc = PortAllocator::new();
        let mut staging = Staging {
            ctx: &ctx,
            work: &work,
            ports: PortAssignment::from_config(&ctx.config),
            allocator: &mut alloc,
        };
        RandomPortCustomizer.customize(&mut staging).unwrap();
        let ports = staging.ports;
        (ports, work, tmp)
    }

    #[test]
    fn fills_all_required_ports_and_keeps_optional_unset() {
        let (ports, work, _tmp) = run(zeroed_config(), true);
        for role in PortAssignment::REQUIRED {
            assert_ne!(ports.get(role), Some(0), "{role} left unset");
        }
        assert_eq!(ports.native_transport_ssl, None);

        let yaml = std::fs::read_to_string(work.config_file()).unwrap();
        assert!(yaml.contains(&format!("native_transport_port: {}\n", ports.native_transport)));
        assert!(!yaml.contains("\nnative_transport_port_ssl:"));
        let opts = std::fs::read_to_string(work.jvm_options_file().unwrap()).unwrap();
        assert!(opts.contains(&format!("-Dcassandra.jmx.local.port={}\n", ports.jmx)));
    }

    #[test]
    fn present_ssl_native_port_is_reassigned() {
        let config = Config {
            native_transport_port_ssl: Some(9142),
            ..Config::default()
        };
        let (ports, _work, _tmp) = run(config, true);
        let ssl = ports.native_transport_ssl.unwrap();
        assert_ne!(ssl, 0);
        assert_ne!(ssl, 9142);
    }

    #[test]
    fn disabled_is_noop() {
        let (ports, work, _tmp) = run(Config::default(), false);
        assert_eq!(ports, PortAssignment::from_config(&Config::default()));
        assert_eq!(std::fs::read_to_string(work.config_file()).unwrap(), YAML);
    }

    #[test]
    fn resolve_only_touches_zero_ports() {
        let mut ports = PortAssignment::from_config(&Config {
            storage_port: 0,
            ..Config::default()
        });
        let mut alloc = PortAllocator::new();
        resolve_unset_ports(&mut ports, &mut alloc).unwrap();
        assert_ne!(ports.storage, 0);
        assert_eq!(ports.native_transport, 9042);
        assert_eq!(alloc.issued(), 1);
    }
}
