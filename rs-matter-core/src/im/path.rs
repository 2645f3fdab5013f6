/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

use core::fmt;

use crate::dm::{attribute_ids, AttrId, ClusterId, EndptId, Provider};

use super::GenericPath;

/// An attribute path with no wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConcreteAttrPath {
    pub endpoint: EndptId,
    pub cluster: ClusterId,
    pub attr: AttrId,
}

impl ConcreteAttrPath {
    pub const fn new(endpoint: EndptId, cluster: ClusterId, attr: AttrId) -> Self {
        Self {
            endpoint,
            cluster,
            attr,
        }
    }

    pub fn to_gp(&self) -> GenericPath {
        GenericPath::new(Some(self.endpoint), Some(self.cluster), Some(self.attr))
    }
}

impl fmt::Display for ConcreteAttrPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}/{:x}/{:x}", self.endpoint, self.cluster, self.attr)
    }
}

/// Expands an attribute path into the concrete paths it covers.
///
/// Paths come out ordered by endpoint, then cluster, then attribute, in the
/// order the provider enumerates them, with each cluster's global
/// attributes after its own. The expander only keeps indices, so it can be
/// parked between report chunks and resumed against the same provider.
///
/// A concrete path is yielded once as is, whether or not the provider has
/// it: reporting that it does not exist is up to the caller. Wildcard paths
/// only ever yield what exists.
#[derive(Debug, Clone)]
pub struct AttrPathExpander {
    path: GenericPath,
    ep_idx: usize,
    cl_idx: usize,
    attr_idx: usize,
    done: bool,
}

impl AttrPathExpander {
    pub const fn new(path: GenericPath) -> Self {
        Self {
            path,
            ep_idx: 0,
            cl_idx: 0,
            attr_idx: 0,
            done: false,
        }
    }

    pub fn path(&self) -> &GenericPath {
        &self.path
    }

    pub fn next(&mut self, provider: &dyn Provider) -> Option<ConcreteAttrPath> {
        if self.done {
            return None;
        }

        if let Ok((endpoint, cluster, attr)) = self.path.not_wildcard() {
            self.done = true;
            return Some(ConcreteAttrPath::new(endpoint, cluster, attr));
        }

        let endpoints = provider.endpoints();

        while let Some(endpoint) = endpoints.get(self.ep_idx) {
            if self.path.endpoint.map_or(true, |id| id == endpoint.id) {
                while let Some(cluster) = endpoint.clusters.get(self.cl_idx) {
                    if self.path.cluster.map_or(true, |id| id == cluster.id) {
                        let attrs = provider.attributes(endpoint.id, cluster.id).unwrap_or(&[]);

                        while let Some(attr) = attribute_ids(attrs).nth(self.attr_idx) {
                            self.attr_idx += 1;

                            if self.path.leaf.map_or(true, |id| id == attr) {
                                return Some(ConcreteAttrPath::new(endpoint.id, cluster.id, attr));
                            }
                        }
                    }

                    self.attr_idx = 0;
                    self.cl_idx += 1;
                }
            }

            self.cl_idx = 0;
            self.ep_idx += 1;
        }

        self.done = true;

        None
    }

    /// Rewinds to the first attribute of the cluster the last path came
    /// from, so that a cluster whose data changed mid-report is sent again
    /// in full.
    pub fn reset_current_cluster(&mut self) {
        self.attr_idx = 0;

        if self.path.not_wildcard().is_ok() {
            self.done = false;
        }
    }
}
