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

//! Report generation for reads and subscriptions.
//!
//! A [`ReadHandler`] owns everything one read or subscription needs across
//! report chunks: the requested paths, the filters, and the cursor telling
//! where the previous chunk stopped.

use core::time::Duration;

use log::{debug, warn};

use crate::dm::{
    atomically, find_attribute, read_global, AttrDetails, AttrValueEncoder, Attribute, ClusterId,
    EndptId, Provider,
};
use crate::error::Error;
use crate::tlv::{TLVWriter, TagType, ToTLV};
use crate::transport::exchange::ExchangeHandle;
use crate::transport::session::SessionHandle;
use crate::utils::storage::WriteBuf;

use super::{
    AttrPath, AttrPathExpander, AttrStatus, ConcreteAttrPath, DataVersionFilter, EventPath,
    IMStatusCode, IM_REVISION, IM_REVISION_TAG,
};

pub const MAX_ATTR_PATHS: usize = 9;
pub const MAX_EVENT_PATHS: usize = 4;
pub const MAX_DATAVER_FILTERS: usize = 8;

/// Clusters remembered as changed before a subscription gives up tracking
/// them one by one and reports everything.
const MAX_CHANGED_CLUSTERS: usize = 8;

// ReportDataMessage
const REPORT_SUBSCRIPTION_ID_TAG: u8 = 0;
const REPORT_ATTRIBUTES_TAG: u8 = 1;
const REPORT_MORE_CHUNKS_TAG: u8 = 3;
const REPORT_SUPPRESS_RESPONSE_TAG: u8 = 4;

// End of the reports array, MoreChunkedMessages or SuppressResponse,
// interaction model revision and end of the message
const REPORT_TRAILER_LEN: usize = 1 + 2 + 3 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// A subscription between reports
    Idle,
    /// Generating the report chunks
    Reporting,
    /// A chunk was sent and the peer has to confirm it
    AwaitingReportResponse,
    /// Done, waiting to be freed
    AwaitingDestruction,
}

/// Which attributes the next report covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportScope {
    All,
    Changed(heapless::Vec<(EndptId, ClusterId), MAX_CHANGED_CLUSTERS>),
}

impl ReportScope {
    pub fn empty() -> Self {
        Self::Changed(heapless::Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Changed(clusters) if clusters.is_empty())
    }

    pub fn add(&mut self, endpoint: EndptId, cluster: ClusterId) {
        if let Self::Changed(clusters) = self {
            if !clusters.contains(&(endpoint, cluster))
                && clusters.push((endpoint, cluster)).is_err()
            {
                *self = Self::All;
            }
        }
    }

    fn covers(&self, endpoint: EndptId, cluster: ClusterId) -> bool {
        match self {
            Self::All => true,
            Self::Changed(clusters) => clusters.contains(&(endpoint, cluster)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: u32,
    pub min_interval: u16,
    pub max_interval: u16,
    /// The subscriber already got the SubscribeResponse, or never expects
    /// one because the subscription was resumed
    pub established: bool,
    pub last_report: Duration,
    /// Changes seen since the last report
    pub dirty: ReportScope,
}

impl Subscription {
    /// When the next report is due: once the minimum interval passed if
    /// something changed, at the maximum interval otherwise.
    pub fn next_report(&self) -> Duration {
        let interval = if self.dirty.is_empty() {
            self.max_interval
        } else {
            self.min_interval
        };

        self.last_report + Duration::from_secs(interval as u64)
    }
}

/// Where the report stopped at the end of the previous chunk.
#[derive(Debug, Clone, Default)]
struct ReportCursor {
    path_idx: usize,
    expander: Option<AttrPathExpander>,
    /// The attribute that did not fit
    pending: Option<ConcreteAttrPath>,
    /// The list item of `pending` to resume from
    list_cursor: Option<u16>,
    /// Data version of the cluster being reported when the chunk started
    cluster_ver: Option<(EndptId, ClusterId, u32)>,
}

pub struct ReadHandler {
    pub state: HandlerState,
    pub exchange: Option<ExchangeHandle>,
    pub session: SessionHandle,
    pub fab_idx: u8,
    pub peer_node_id: u64,
    pub fabric_filtered: bool,
    pub attr_paths: heapless::Vec<AttrPath, MAX_ATTR_PATHS>,
    pub event_paths: heapless::Vec<EventPath, MAX_EVENT_PATHS>,
    pub dataver_filters: heapless::Vec<DataVersionFilter, MAX_DATAVER_FILTERS>,
    pub subscription: Option<Subscription>,
    scope: ReportScope,
    cursor: ReportCursor,
    more: bool,
}

impl ReadHandler {
    pub fn new(
        exchange: Option<ExchangeHandle>,
        session: SessionHandle,
        fab_idx: u8,
        peer_node_id: u64,
        fabric_filtered: bool,
    ) -> Self {
        Self {
            state: HandlerState::Reporting,
            exchange,
            session,
            fab_idx,
            peer_node_id,
            fabric_filtered,
            attr_paths: heapless::Vec::new(),
            event_paths: heapless::Vec::new(),
            dataver_filters: heapless::Vec::new(),
            subscription: None,
            scope: ReportScope::All,
            cursor: ReportCursor::default(),
            more: false,
        }
    }

    pub fn is_subscription(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn subscription_id(&self) -> Option<u32> {
        self.subscription.as_ref().map(|sub| sub.id)
    }

    /// Whether the last chunk sent left attributes for another one.
    pub fn has_more_chunks(&self) -> bool {
        self.more
    }

    /// Prepares a new report over `scope`, sent on `exchange`.
    pub fn start_report(&mut self, exchange: ExchangeHandle, scope: ReportScope) {
        self.state = HandlerState::Reporting;
        self.exchange = Some(exchange);
        self.scope = scope;
        self.cursor = ReportCursor::default();
        self.more = false;
    }

    /// Records that the attributes of a cluster changed.
    pub fn mark_dirty(&mut self, endpoint: EndptId, cluster: ClusterId) {
        let covered = self
            .attr_paths
            .iter()
            .any(|path| path.to_gp().covers_cluster(endpoint, cluster));

        if let Some(sub) = self.subscription.as_mut() {
            if covered {
                sub.dirty.add(endpoint, cluster);
            }
        }
    }

    /// Writes the next ReportDataMessage chunk. Returns whether more chunks
    /// are needed.
    ///
    /// `suppress_response` is set on the last chunk of a plain read, which
    /// the peer then does not acknowledge with a StatusResponse.
    pub fn encode_report(
        &mut self,
        provider: &dyn Provider,
        wb: &mut WriteBuf,
        suppress_response: bool,
    ) -> Result<bool, Error> {
        let mut tw = TLVWriter::new(wb);

        tw.start_struct(TagType::Anonymous)?;
        if let Some(id) = self.subscription_id() {
            tw.u32(TagType::Context(REPORT_SUBSCRIPTION_ID_TAG), id)?;
        }
        tw.start_array(TagType::Context(REPORT_ATTRIBUTES_TAG))?;

        tw.get_buf().shrink(REPORT_TRAILER_LEN)?;
        let complete = self.fill_reports(provider, &mut tw);
        tw.get_buf().expand(REPORT_TRAILER_LEN)?;
        let complete = complete?;

        tw.end_container()?;
        if !complete {
            tw.bool(TagType::Context(REPORT_MORE_CHUNKS_TAG), true)?;
        } else if suppress_response {
            tw.bool(TagType::Context(REPORT_SUPPRESS_RESPONSE_TAG), true)?;
        }
        tw.u8(TagType::Context(IM_REVISION_TAG), IM_REVISION)?;
        tw.end_container()?;

        self.more = !complete;

        Ok(self.more)
    }

    /// Writes as many AttributeReportIBs as fit. Returns whether all were
    /// written.
    fn fill_reports(&mut self, provider: &dyn Provider, tw: &mut TLVWriter) -> Result<bool, Error> {
        self.check_cluster_version(provider);

        let mut progress = false;

        loop {
            let (path, wildcard) = match self.cursor.pending.take() {
                Some(path) => (path, self.is_wildcard()),
                None => match self.next_path(provider) {
                    Some(next) => next,
                    None => return Ok(true),
                },
            };

            let anchor = tw.get_tail();

            match self.encode_path(provider, tw, &path, wildcard) {
                Ok(()) => {
                    progress = true;
                    self.cursor.list_cursor = None;
                }
                Err(e) if e.is_out_of_space() => {
                    if progress || tw.get_tail() > anchor {
                        self.cursor.pending = Some(path);
                        return Ok(false);
                    }

                    // Does not fit even in an empty message
                    warn!("Attribute {} too large to report", path);
                    self.cursor.list_cursor = None;
                    if !wildcard {
                        write_attr_status(tw, &path, IMStatusCode::ResourceExhausted)?;
                        progress = true;
                    }
                }
                Err(e) => {
                    tw.rewind_to(anchor);
                    self.cursor.list_cursor = None;

                    if wildcard {
                        debug!("Skipping {}: {:?}", path, e);
                        continue;
                    }

                    if let Err(e) = write_attr_status(tw, &path, e.into()) {
                        if e.is_out_of_space() && progress {
                            self.cursor.pending = Some(path);
                            return Ok(false);
                        }
                        return Err(e);
                    }
                    progress = true;
                }
            }
        }
    }

    fn is_wildcard(&self) -> bool {
        self.cursor
            .expander
            .as_ref()
            .is_some_and(|expander| expander.path().is_wildcard())
    }

    /// A cluster that changed between two chunks is reported again from its
    /// first attribute, so that the peer never sees a mix of its old and new
    /// state.
    fn check_cluster_version(&mut self, provider: &dyn Provider) {
        let Some((endpoint, cluster, ver)) = self.cursor.cluster_ver else {
            return;
        };

        let current = provider.data_version(endpoint, cluster);
        if current == ver || !self.is_wildcard() {
            return;
        }

        debug!(
            "Cluster {:x}/{:x} changed mid-report, restarting it",
            endpoint, cluster
        );

        if let Some(expander) = self.cursor.expander.as_mut() {
            expander.reset_current_cluster();
        }
        self.cursor.pending = None;
        self.cursor.list_cursor = None;
        self.cursor.cluster_ver = Some((endpoint, cluster, current));
    }

    fn next_path(&mut self, provider: &dyn Provider) -> Option<(ConcreteAttrPath, bool)> {
        loop {
            if self.cursor.expander.is_none() {
                let path = self.attr_paths.get(self.cursor.path_idx)?;
                self.cursor.expander = Some(AttrPathExpander::new(path.to_gp()));
            }

            let expander = self.cursor.expander.as_mut()?;
            let wildcard = expander.path().is_wildcard();

            let Some(path) = expander.next(provider) else {
                self.cursor.expander = None;
                self.cursor.path_idx += 1;
                continue;
            };

            if !self.scope.covers(path.endpoint, path.cluster) {
                continue;
            }

            let ver = provider.data_version(path.endpoint, path.cluster);
            if self
                .dataver_filters
                .iter()
                .any(|f| {
                    f.endpoint == path.endpoint && f.cluster == path.cluster && f.data_ver == ver
                })
            {
                continue;
            }

            let same_cluster = matches!(
                self.cursor.cluster_ver,
                Some((e, c, _)) if e == path.endpoint && c == path.cluster
            );
            if !same_cluster {
                self.cursor.cluster_ver = Some((path.endpoint, path.cluster, ver));
            }

            return Some((path, wildcard));
        }
    }

    fn encode_path(
        &mut self,
        provider: &dyn Provider,
        tw: &mut TLVWriter,
        path: &ConcreteAttrPath,
        wildcard: bool,
    ) -> Result<(), Error> {
        let attrs = provider.attributes(path.endpoint, path.cluster)?;
        find_attribute(attrs, path.attr)?;

        let details = AttrDetails {
            endpoint_id: path.endpoint,
            cluster_id: path.cluster,
            attr_id: path.attr,
            list_index: None,
            fab_idx: self.fab_idx,
            fab_filter: self.fabric_filtered,
            wildcard,
            timed: false,
        };

        let dataver = provider.data_version(path.endpoint, path.cluster);
        let encoder = AttrValueEncoder::new(tw, *path, dataver, &mut self.cursor.list_cursor);

        if Attribute::is_global(path.attr) {
            read_global(provider, &details, encoder)
        } else {
            provider.read_attribute(&details, encoder)
        }
    }
}

/// Writes an AttributeReportIB carrying a status instead of data.
fn write_attr_status(
    tw: &mut TLVWriter,
    path: &ConcreteAttrPath,
    status: IMStatusCode,
) -> Result<(), Error> {
    atomically(tw, |tw| {
        tw.start_struct(TagType::Anonymous)?;
        AttrStatus::new(&path.to_gp(), status).to_tlv(tw, TagType::Context(0))?;
        tw.end_container()
    })
}

impl core::fmt::Debug for ReadHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReadHandler")
            .field("state", &self.state)
            .field("exchange", &self.exchange)
            .field("session", &self.session)
            .field("peer", &self.peer_node_id)
            .field("subscription", &self.subscription_id())
            .finish()
    }
}
