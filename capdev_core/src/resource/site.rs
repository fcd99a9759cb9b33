use super::{Request, Resource, Response, SimpleResource, TimeResource};
use crate::coap::ContentFormat;
use crate::config::ServerConfig;
use crate::gate::AuthorizationGate;
use crate::token::Action;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Path of the CoRE resource discovery listing
pub const WELL_KNOWN_CORE: [&str; 2] = [".well-known", "core"];

/// The resource tree: Uri-Path segments to handlers
#[derive(Default, Clone)]
pub struct Site {
    resources: BTreeMap<Vec<String>, Arc<dyn Resource>>,
}

impl Site {
    pub fn new() -> Self {
        Self::default()
    }

    /// The device's resource tree: the observable clock and the stored
    /// resource, both behind `gate`
    pub fn device(config: &ServerConfig, gate: AuthorizationGate) -> Self {
        let mut site = Self::new();
        site.add_resource(
            &[config.time_path.as_str()],
            Arc::new(TimeResource::new(
                config.time_path.clone(),
                gate.clone(),
                config.observe_interval(),
            )),
        );
        site.add_resource(
            &[config.resource_path.as_str()],
            Arc::new(SimpleResource::with_content(
                config.resource_path.clone(),
                gate,
                config.initial_content.clone().into_bytes(),
            )),
        );
        site
    }

    pub fn add_resource(&mut self, path: &[&str], resource: Arc<dyn Resource>) {
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        debug!("Registering resource /{}", path.join("/"));
        self.resources.insert(path, resource);
    }

    pub fn get(&self, path: &[String]) -> Option<Arc<dyn Resource>> {
        self.resources.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Registered observable resources with their slash-joined path
    pub fn observable(&self) -> Vec<(String, Arc<dyn Resource>)> {
        self.resources
            .iter()
            .filter(|(_, resource)| resource.is_observable())
            .map(|(path, resource)| (path.join("/"), Arc::clone(resource)))
            .collect()
    }

    /// RFC 6690 link format listing of the tree
    pub fn link_format(&self) -> String {
        let well_known = format!("</{}>;ct={}", WELL_KNOWN_CORE.join("/"), ContentFormat::LinkFormat.id());
        std::iter::once(well_known)
            .chain(self.resources.iter().map(|(path, resource)| {
                let mut link = format!("</{}>", path.join("/"));
                if resource.is_observable() {
                    link.push_str(";obs");
                }
                link
            }))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub async fn render(&self, request: &Request) -> Response {
        if request.path == WELL_KNOWN_CORE {
            return match request.method {
                Action::Get => Response {
                    content_format: Some(ContentFormat::LinkFormat),
                    ..Response::content(self.link_format().into_bytes())
                },
                _ => Response::method_not_allowed(),
            };
        }

        match self.get(&request.path) {
            Some(resource) => resource.render(request).await,
            None => Response::not_found(),
        }
    }
}

impl fmt::Debug for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Site")
            .field("paths", &self.resources.keys().collect::<Vec<_>>())
            .finish()
    }
}
