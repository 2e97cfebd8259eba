use crate::domain::container::ContainerStartResponse;
use crate::domain::infra::Infrastructure;
use crate::service::ide::IdeService;

/// URL a user opens to reach a started gitspace.
///
/// A statically configured port mapping wins over the port the engine
/// published; the proxy host of the infra wins over its gitspace host.
pub fn ide_url(
    ide: &dyn IdeService,
    infra: &Infrastructure,
    response: &ContainerStartResponse,
) -> String {
    let ide_port = ide.port().port;
    let port = match infra.port_mappings.get(&ide_port) {
        Some(mapping) if mapping.published_port != 0 => mapping.forwarded_port.to_string(),
        _ => response
            .published_ports
            .get(&ide_port)
            .cloned()
            .unwrap_or_default(),
    };

    ide.generate_url(
        &response.absolute_repo_path,
        infra.url_host(),
        &port,
        &response.remote_user,
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::domain::ide::IdeType;
    use crate::domain::infra::{InfraStatus, PortMapping};
    use crate::infra::template::ScriptTemplates;
    use crate::service::ide::{IdeFactory, SSH_PORT, VSCODE_WEB_PORT};
    use crate::service::orchestrator::testing::infra;

    fn ide(ide: IdeType) -> Arc<dyn IdeService> {
        IdeFactory::new(Arc::new(ScriptTemplates::new().unwrap()))
            .get(ide)
            .unwrap()
    }

    fn response(port: u16, published: &str) -> ContainerStartResponse {
        ContainerStartResponse {
            container_id: "c0ffee".to_string(),
            container_name: "gitspace-alice-app".to_string(),
            published_ports: HashMap::from([(port, published.to_string())]),
            absolute_repo_path: "/home/gitspace/app".to_string(),
            remote_user: "gitspace".to_string(),
        }
    }

    #[test]
    fn test_dynamic_port_for_vscode_web() {
        let url = ide_url(
            ide(IdeType::VsCodeWeb).as_ref(),
            &infra(InfraStatus::Provisioned, VSCODE_WEB_PORT),
            &response(VSCODE_WEB_PORT, "32768"),
        );
        assert_eq!(url, "http://localhost:32768?folder=/home/gitspace/app");
    }

    #[test]
    fn test_proxy_host_is_preferred() {
        let mut infra = infra(InfraStatus::Provisioned, VSCODE_WEB_PORT);
        infra.proxy_host = Some("gitspaces.example.com".to_string());
        let url = ide_url(
            ide(IdeType::VsCodeWeb).as_ref(),
            &infra,
            &response(VSCODE_WEB_PORT, "32768"),
        );
        assert_eq!(url, "http://gitspaces.example.com:32768?folder=/home/gitspace/app");
    }

    #[test]
    fn test_static_mapping_uses_forwarded_port() {
        let mut infra = infra(InfraStatus::Provisioned, SSH_PORT);
        infra.port_mappings.insert(
            SSH_PORT,
            PortMapping {
                published_port: 2222,
                forwarded_port: 443,
            },
        );
        let url = ide_url(
            ide(IdeType::VsCode).as_ref(),
            &infra,
            &response(SSH_PORT, "32769"),
        );
        assert_eq!(
            url,
            "vscode-remote://ssh-remote+gitspace@localhost:443/home/gitspace/app"
        );
    }

    #[test]
    fn test_jetbrains_gateway_url() {
        let url = ide_url(
            ide(IdeType::Goland).as_ref(),
            &infra(InfraStatus::Provisioned, SSH_PORT),
            &response(SSH_PORT, "32770"),
        );
        assert!(url.starts_with("jetbrains-gateway://connect#idePath="));
        assert!(url.contains("&host=localhost&port=32770&user=gitspace"));
    }
}
