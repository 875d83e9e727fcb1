use k8s_openapi::api::{
    core::v1::{Endpoints, Service},
    networking::v1::ServiceBackendPort,
};

/// True when at least one subset carries a ready address.
pub fn endpoints_have_subsets(ep: Option<&Endpoints>) -> bool {
    ep.and_then(|ep| ep.subsets.as_ref())
        .into_iter()
        .flatten()
        .any(|subset| subset.addresses.as_ref().map_or(false, |a| !a.is_empty()))
}

/// Looks up the port number a backend reference points at on `svc`.
pub fn get_service_port(svc: Option<&Service>, port: &ServiceBackendPort) -> Option<i32> {
    let ports = svc.and_then(|s| s.spec.as_ref()).and_then(|s| s.ports.as_ref())?;
    ports
        .iter()
        .find(|sp| match (port.number, port.name.as_deref()) {
            (Some(number), _) => sp.port == number,
            (None, Some(name)) => sp.name.as_deref() == Some(name),
            (None, None) => false,
        })
        .map(|sp| sp.port)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, ServicePort, ServiceSpec};

    use super::*;

    fn endpoints(subsets: Vec<EndpointSubset>) -> Endpoints {
        Endpoints {
            subsets: Some(subsets),
            ..Default::default()
        }
    }

    fn service() -> Service {
        Service {
            spec: Some(ServiceSpec {
                ports: Some(vec![
                    ServicePort {
                        name: Some("http".to_string()),
                        port: 8080,
                        ..Default::default()
                    },
                    ServicePort {
                        name: Some("https".to_string()),
                        port: 8443,
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn endpoints_without_addresses() {
        assert!(!endpoints_have_subsets(None));
        assert!(!endpoints_have_subsets(Some(&Endpoints::default())));
        assert!(!endpoints_have_subsets(Some(&endpoints(vec![
            EndpointSubset::default(),
            EndpointSubset {
                addresses: Some(vec![]),
                ..Default::default()
            },
        ]))));
    }

    #[test]
    fn endpoints_with_one_address() {
        assert!(endpoints_have_subsets(Some(&endpoints(vec![
            EndpointSubset::default(),
            EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.0.0.1".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
        ]))));
    }

    #[test]
    fn service_port_by_name_and_number() {
        let svc = service();
        let by_name = ServiceBackendPort {
            name: Some("https".to_string()),
            number: None,
        };
        let by_number = ServiceBackendPort {
            name: None,
            number: Some(8080),
        };
        assert_eq!(get_service_port(Some(&svc), &by_name), Some(8443));
        assert_eq!(get_service_port(Some(&svc), &by_number), Some(8080));
    }

    #[test]
    fn service_port_misses() {
        let svc = service();
        let unknown_name = ServiceBackendPort {
            name: Some("grpc".to_string()),
            number: None,
        };
        let unknown_number = ServiceBackendPort {
            name: None,
            number: Some(80),
        };
        assert_eq!(get_service_port(Some(&svc), &unknown_name), None);
        assert_eq!(get_service_port(Some(&svc), &unknown_number), None);
        assert_eq!(get_service_port(Some(&svc), &ServiceBackendPort::default()), None);
        assert_eq!(get_service_port(None, &unknown_name), None);
    }
}
