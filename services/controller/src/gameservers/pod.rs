//! The pod that backs a game server.

use std::path::Path;

use fleetplane_api::{
    env, labels, Container, ContainerPort, EnvVar, GameServer, ObjectMeta, OwnerReference, Pod,
    PodSpec, PodStatus, PortPolicy,
};

/// Build the pod for `gs` from its spec and assigned ports.
///
/// The pod shares the game server's namespace and name, carries the role
/// and game server labels, and exposes identity and the SDK socket path to
/// the container through the environment.
pub fn build_pod(gs: &GameServer, sdk_socket: &Path) -> Pod {
    let mut metadata = ObjectMeta::named(&gs.metadata.namespace, &gs.metadata.name);
    metadata.labels = gs.metadata.labels.clone();
    metadata
        .labels
        .insert(labels::ROLE.into(), labels::ROLE_GAME_SERVER.into());
    metadata
        .labels
        .insert(labels::GAME_SERVER.into(), gs.metadata.name.clone());
    metadata.owner = Some(OwnerReference::of(gs));

    let spec = &gs.spec;
    let mut env_vars: Vec<EnvVar> = spec
        .container
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: value.clone(),
        })
        .collect();
    for (name, value) in [
        (env::GAME_SERVER_NAME, gs.metadata.name.clone()),
        (env::GAME_SERVER_NAMESPACE, gs.metadata.namespace.clone()),
        (env::SDK_SOCKET, sdk_socket.display().to_string()),
    ] {
        env_vars.push(EnvVar {
            name: name.to_string(),
            value,
        });
    }

    let ports = spec
        .ports
        .iter()
        .map(|port| {
            let host_port = gs
                .status
                .ports
                .iter()
                .find(|sp| sp.name == port.name)
                .map(|sp| sp.port)
                .or(port.host_port);
            let container_port = match (port.port_policy, host_port) {
                (PortPolicy::Passthrough, Some(host)) => host,
                _ => port.container_port,
            };
            ContainerPort {
                name: port.name.clone(),
                container_port,
                host_port,
                protocol: port.protocol,
            }
        })
        .collect();

    Pod {
        metadata,
        spec: PodSpec {
            containers: vec![Container {
                name: spec.container.name.clone(),
                image: spec.container.image.clone(),
                command: spec.container.command.clone(),
                args: spec.container.args.clone(),
                env: env_vars,
                ports,
            }],
            node_selector: spec.node_selector.clone(),
            scheduling: spec.scheduling,
        },
        status: PodStatus::default(),
    }
}
