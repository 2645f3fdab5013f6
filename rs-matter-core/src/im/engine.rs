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

use core::cell::{Cell, RefCell};
use core::time::Duration;

use cfg_if::cfg_if;
use log::{debug, info, warn};

use crate::dm::{ClusterId, EndptId, Provider};
use crate::error::{Error, ErrorCode};
use crate::persist::KvStore;
use crate::tlv::{get_root_node_struct, print_tlv_list, FromTLV, TLVElement, TLVWriter, TagType};
use crate::transport::exchange::{
    ExchangeCtx, ExchangeDelegate, ExchangeHandle, ExchangeMgr, RxMessage,
};
use crate::transport::session::{Session, SessionHandle, SessionMode, SessionReleaseListener};
use crate::utils::rand::Rand;
use crate::utils::storage::{Pool, PoolHandle, WriteBuf};

use super::report::{HandlerState, ReadHandler, ReportScope, Subscription};
use super::resumption::{SubscriptionInfo, SubscriptionStore};
use super::{
    parse_status_response, write_status_response, AttrPath, DataVersionFilter, EventPath,
    IMStatusCode, OpCode, IM_REVISION, IM_REVISION_TAG, PROTO_ID_INTERACTION_MODEL,
};

cfg_if! {
    if #[cfg(feature = "small-pools")] {
        pub const MAX_READ_HANDLERS: usize = 3;
    } else {
        pub const MAX_READ_HANDLERS: usize = 8;
    }
}

/// Timed interactions that may be pending at once.
pub const MAX_TIMED_INTERACTIONS: usize = 4;

/// How long we wait for a peer to acknowledge a report chunk or to follow
/// up a timed request.
pub const IM_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct TimedEntry {
    exchange: ExchangeHandle,
    deadline: Duration,
}

/// Serves the interaction model protocol.
///
/// Reads and subscriptions are tracked in a fixed pool of [`ReadHandler`]s.
/// Writes and invokes are answered within the callback that received them.
pub struct InteractionModel<'a> {
    provider: &'a dyn Provider,
    kv: &'a RefCell<dyn KvStore + 'a>,
    handlers: RefCell<Pool<ReadHandler, MAX_READ_HANDLERS>>,
    timed: RefCell<heapless::Vec<TimedEntry, MAX_TIMED_INTERACTIONS>>,
    changes: RefCell<ReportScope>,
    next_sub_id: Cell<u32>,
}

impl<'a> InteractionModel<'a> {
    pub fn new(provider: &'a dyn Provider, kv: &'a RefCell<dyn KvStore + 'a>, rand: Rand) -> Self {
        let mut id = [0; 4];
        rand(&mut id);

        Self {
            provider,
            kv,
            handlers: RefCell::new(Pool::new()),
            timed: RefCell::new(heapless::Vec::new()),
            changes: RefCell::new(ReportScope::empty()),
            next_sub_id: Cell::new(u32::from_le_bytes(id)),
        }
    }

    /// Starts answering interaction model requests arriving on `mgr`.
    pub fn register(&'a self, mgr: &mut ExchangeMgr<'a>) -> Result<(), Error> {
        mgr.register_unsolicited_handler(PROTO_ID_INTERACTION_MODEL, None, self)?;
        mgr.add_session_listener(self)
    }

    pub fn provider(&self) -> &'a dyn Provider {
        self.provider
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.borrow().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.handlers
            .borrow()
            .iter()
            .filter(|(_, h)| h.is_subscription())
            .count()
    }

    /// Records that attributes of a cluster changed. Subscribers are told on
    /// the next [`InteractionModel::process_subscriptions`].
    pub fn notify_changed(&self, endpoint: EndptId, cluster: ClusterId) {
        self.changes.borrow_mut().add(endpoint, cluster);
    }

    /// Sends the reports that are due and drops handlers whose session or
    /// exchange is gone.
    pub fn process_subscriptions(&'a self, mgr: &mut ExchangeMgr<'a>) -> Result<(), Error> {
        let now = mgr.now();

        let due = {
            let mut handlers = self.handlers.borrow_mut();
            self.sweep(&mut handlers, mgr);
            self.apply_changes(&mut handlers);

            handlers.handles_where(|h| {
                h.state == HandlerState::Idle
                    && h.subscription
                        .as_ref()
                        .is_some_and(|sub| sub.next_report() <= now)
            })
        };

        for handle in due {
            if let Err(e) = self.send_subscription_report(mgr, handle) {
                warn!("Subscription report failed: {:?}", e);
            }
        }

        Ok(())
    }

    /// The earliest time a subscription report becomes due.
    pub fn next_wakeup(&self) -> Option<Duration> {
        let handlers = self.handlers.borrow();
        let changed = !self.changes.borrow().is_empty();

        handlers
            .iter()
            .filter(|(_, h)| h.state == HandlerState::Idle)
            .filter_map(|(_, h)| h.subscription.as_ref())
            .map(|sub| {
                if changed {
                    sub.last_report + Duration::from_secs(sub.min_interval as u64)
                } else {
                    sub.next_report()
                }
            })
            .min()
    }

    /// Re-establishes the subscriptions a peer held before we restarted,
    /// now that `session` connects us to it again.
    ///
    /// Each one gets a priming report; the peer already knows the
    /// subscription id so no SubscribeResponse follows.
    pub fn resume_subscriptions(
        &'a self,
        mgr: &mut ExchangeMgr<'a>,
        session: SessionHandle,
    ) -> Result<usize, Error> {
        let (fab_idx, node_id) = {
            let session = mgr.sessions().get(session).ok_or(ErrorCode::NoSession)?;
            if !matches!(session.mode(), SessionMode::Case { .. }) {
                return Ok(0);
            }
            (
                session.fab_idx(),
                session.get_peer_nodeid().ok_or(ErrorCode::NoSession)?,
            )
        };

        let subscriptions =
            SubscriptionStore::new(&mut *self.kv.borrow_mut()).load(fab_idx, node_id)?;

        let mut resumed = 0;
        for info in subscriptions {
            let active = self
                .handlers
                .borrow()
                .iter()
                .any(|(_, h)| h.subscription_id() == Some(info.subscription_id));
            if active {
                continue;
            }

            let exchange = mgr.new_exchange(session, self)?;

            let mut handler =
                ReadHandler::new(Some(exchange), session, fab_idx, node_id, info.fabric_filtered);
            handler.attr_paths = info.attr_paths;
            handler.event_paths = info.event_paths;
            handler.subscription = Some(Subscription {
                id: info.subscription_id,
                min_interval: info.min_interval,
                max_interval: info.max_interval,
                established: true,
                last_report: mgr.now(),
                dirty: ReportScope::empty(),
            });

            let handle = match self.alloc_handler(handler) {
                Ok(handle) => handle,
                Err(e) => {
                    if let Err(close_err) = mgr.close(exchange) {
                        warn!("Could not close the subscribe exchange: {:?}", close_err);
                    }
                    Err(e)?
                }
            };

            self.send_chunk(&mut ExchangeCtx::new(mgr, exchange), handle)?;
            resumed += 1;
        }

        if resumed > 0 {
            info!(
                "Resumed {} subscription(s) of {:x} on fabric {}",
                resumed, node_id, fab_idx
            );
        }

        Ok(resumed)
    }

    /// Forgets every subscription of a fabric, live and persisted.
    pub fn remove_fabric(&self, fab_idx: u8) -> Result<(), Error> {
        {
            let mut handlers = self.handlers.borrow_mut();
            for handle in handlers.handles_where(|h| h.fab_idx == fab_idx) {
                Self::retire(&mut handlers, handle);
            }
        }

        SubscriptionStore::new(&mut *self.kv.borrow_mut()).delete_fabric(fab_idx)
    }

    /// Drops all handlers. Persisted subscriptions are kept for resumption.
    pub fn shutdown(&self) {
        let mut handlers = self.handlers.borrow_mut();
        for handle in handlers.handles_where(|_| true) {
            handlers.free(handle);
        }
        self.timed.borrow_mut().clear();
    }

    fn alloc_handler(&self, handler: ReadHandler) -> Result<PoolHandle, Error> {
        self.handlers.borrow_mut().alloc(handler).map_err(|h| {
            warn!("No room for another read handler, rejecting {:x}", h.peer_node_id);
            ErrorCode::ResourceExhausted.into()
        })
    }

    fn handler_for(&self, exchange: ExchangeHandle) -> Option<PoolHandle> {
        let handlers = self.handlers.try_borrow().ok()?;
        let handle = handlers
            .iter()
            .find(|(_, h)| h.exchange == Some(exchange))
            .map(|(handle, _)| handle);

        handle
    }

    /// Frees a handler right away unless a report is in flight, in which
    /// case it goes once the peer answers or the exchange dies.
    fn retire(handlers: &mut Pool<ReadHandler, MAX_READ_HANDLERS>, handle: PoolHandle) {
        let Some(h) = handlers.get_mut(handle) else {
            return;
        };

        if h.exchange.is_some() {
            h.state = HandlerState::AwaitingDestruction;
        } else {
            handlers.free(handle);
        }
    }

    fn sweep(&self, handlers: &mut Pool<ReadHandler, MAX_READ_HANDLERS>, mgr: &ExchangeMgr<'_>) {
        let stale = handlers.handles_where(|h| {
            mgr.sessions().get(h.session).is_none()
                || h.exchange
                    .is_some_and(|exchange| mgr.exchange_session(exchange).is_none())
                || (h.state == HandlerState::AwaitingDestruction && h.exchange.is_none())
        });

        for handle in stale {
            if let Some(h) = handlers.free(handle) {
                debug!("Dropping stale read handler {:?}", h);
            }
        }
    }

    fn apply_changes(&self, handlers: &mut Pool<ReadHandler, MAX_READ_HANDLERS>) {
        let changes = core::mem::replace(&mut *self.changes.borrow_mut(), ReportScope::empty());

        match changes {
            ReportScope::All => {
                for (_, h) in handlers.iter_mut() {
                    if let Some(sub) = h.subscription.as_mut() {
                        sub.dirty = ReportScope::All;
                    }
                }
            }
            ReportScope::Changed(clusters) => {
                for (endpoint, cluster) in clusters {
                    for (_, h) in handlers.iter_mut() {
                        h.mark_dirty(endpoint, cluster);
                    }
                }
            }
        }
    }

    fn send_subscription_report(
        &'a self,
        mgr: &mut ExchangeMgr<'a>,
        handle: PoolHandle,
    ) -> Result<(), Error> {
        let session = self
            .handlers
            .borrow()
            .get(handle)
            .map(|h| h.session)
            .ok_or(ErrorCode::NotFound)?;

        let exchange = mgr.new_exchange(session, self)?;

        {
            let mut handlers = self.handlers.borrow_mut();
            let h = handlers.get_mut(handle).ok_or(ErrorCode::NotFound)?;
            let scope = match h.subscription.as_mut() {
                Some(sub) => core::mem::replace(&mut sub.dirty, ReportScope::empty()),
                None => ReportScope::All,
            };
            h.start_report(exchange, scope);
        }

        let mut ctx = ExchangeCtx::new(mgr, exchange);
        let result = self.send_chunk(&mut ctx, handle);

        if result.is_err() {
            // Leave the subscription in place and retry at the next interval
            if let Some(h) = self.handlers.borrow_mut().get_mut(handle) {
                h.state = HandlerState::Idle;
                h.exchange = None;
                if let Some(sub) = h.subscription.as_mut() {
                    sub.last_report = ctx.now();
                }
            }
            if let Err(e) = ctx.close() {
                warn!("Could not close the report exchange: {:?}", e);
            }
        }

        result
    }

    /// Sends the next report chunk of a handler on the exchange of `ctx`.
    fn send_chunk(&self, ctx: &mut ExchangeCtx, handle: PoolHandle) -> Result<(), Error> {
        let done = {
            let mut handlers = self.handlers.borrow_mut();
            let h = handlers.get_mut(handle).ok_or(ErrorCode::NotFound)?;
            let suppress = !h.is_subscription();

            let mut more = false;
            ctx.send_with(OpCode::ReportData, |wb| {
                more = h.encode_report(self.provider, wb, suppress)?;
                Ok(())
            })?;

            if more || !suppress {
                h.state = HandlerState::AwaitingReportResponse;
                false
            } else {
                true
            }
        };

        if done {
            self.handlers.borrow_mut().free(handle);
            ctx.close()
        } else {
            ctx.set_response_timeout(Some(IM_RESPONSE_TIMEOUT))
        }
    }

    fn new_handler(&self, ctx: &ExchangeCtx, fabric_filtered: bool) -> Result<ReadHandler, Error> {
        let session = ctx.session()?;
        let info = ctx.session_info()?;
        if !info.mode().is_secure() {
            Err(ErrorCode::UnsupportedAccess)?;
        }

        Ok(ReadHandler::new(
            Some(ctx.handle()),
            session,
            info.fab_idx(),
            info.get_peer_nodeid().unwrap_or(0),
            fabric_filtered,
        ))
    }

    fn handle_read(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let root = get_root_node_struct(rx.payload)?;

        let mut handler = self.new_handler(ctx, root.ctx::<Option<bool>>(3)?.unwrap_or(true))?;
        parse_paths(&root, &mut handler, 0, 1, 4)?;
        if handler.attr_paths.is_empty() && handler.event_paths.is_empty() {
            Err(ErrorCode::InvalidAction)?;
        }

        debug!("Read of {} path(s) on {:?}", handler.attr_paths.len(), ctx.handle());

        let handle = self.alloc_handler(handler)?;
        self.send_chunk(ctx, handle)
    }

    fn handle_subscribe(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let root = get_root_node_struct(rx.payload)?;

        let keep_subscriptions: bool = root.ctx(0)?;
        let min_floor: u16 = root.ctx(1)?;
        let max_ceiling: u16 = root.ctx(2)?;
        if max_ceiling < min_floor {
            Err(ErrorCode::InvalidAction)?;
        }

        let mut handler = self.new_handler(ctx, root.ctx::<Option<bool>>(7)?.unwrap_or(true))?;
        parse_paths(&root, &mut handler, 3, 4, 8)?;
        if handler.attr_paths.is_empty() && handler.event_paths.is_empty() {
            Err(ErrorCode::InvalidAction)?;
        }

        if !keep_subscriptions {
            self.drop_peer_subscriptions(handler.fab_idx, handler.peer_node_id);
        }

        let id = self.next_sub_id.get();
        self.next_sub_id.set(id.wrapping_add(1));

        info!(
            "Subscription {:x} from {:x}: {} path(s), interval {}..{}s",
            id,
            handler.peer_node_id,
            handler.attr_paths.len(),
            min_floor,
            max_ceiling
        );

        handler.subscription = Some(Subscription {
            id,
            min_interval: min_floor,
            max_interval: max_ceiling,
            established: false,
            last_report: ctx.now(),
            dirty: ReportScope::empty(),
        });

        let handle = self.alloc_handler(handler)?;
        self.send_chunk(ctx, handle)
    }

    fn drop_peer_subscriptions(&self, fab_idx: u8, node_id: u64) {
        {
            let mut handlers = self.handlers.borrow_mut();
            let old = handlers.handles_where(|h| {
                h.is_subscription() && h.fab_idx == fab_idx && h.peer_node_id == node_id
            });
            for handle in old {
                Self::retire(&mut handlers, handle);
            }
        }

        if let Err(e) =
            SubscriptionStore::new(&mut *self.kv.borrow_mut()).delete_peer(fab_idx, node_id)
        {
            warn!("Failed to forget subscriptions of {:x}: {:?}", node_id, e);
        }
    }

    fn handle_status_response(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let status = parse_status_response(rx.payload)?;
        let handle = self.handler_for(ctx.handle()).ok_or(ErrorCode::InvalidAction)?;

        enum Next {
            Chunk,
            SubscribeResponse(u32, u16),
            Close,
            Free,
        }

        let next = {
            let mut handlers = self.handlers.borrow_mut();
            let h = handlers.get_mut(handle).ok_or(ErrorCode::NotFound)?;

            if status != IMStatusCode::Success {
                info!("Peer {:x} ended the report with {:?}", h.peer_node_id, status);
                if let Some(id) = h.subscription_id() {
                    self.forget(h.fab_idx, h.peer_node_id, id);
                }
                Next::Free
            } else if h.state == HandlerState::AwaitingDestruction {
                Next::Free
            } else if h.state != HandlerState::AwaitingReportResponse {
                Err(ErrorCode::InvalidAction)?
            } else if h.has_more_chunks() {
                h.state = HandlerState::Reporting;
                Next::Chunk
            } else if let Some(sub) = h.subscription.as_mut() {
                sub.last_report = ctx.now();
                h.state = HandlerState::Idle;
                h.exchange = None;

                if sub.established {
                    Next::Close
                } else {
                    sub.established = true;
                    Next::SubscribeResponse(sub.id, sub.max_interval)
                }
            } else {
                Next::Free
            }
        };

        match next {
            Next::Chunk => self.send_chunk(ctx, handle),
            Next::SubscribeResponse(id, max_interval) => {
                ctx.send_with(OpCode::SubscribeResponse, |wb| {
                    write_subscribe_response(wb, id, max_interval)
                })?;
                self.persist(handle);
                ctx.close()
            }
            Next::Close => ctx.close(),
            Next::Free => {
                self.handlers.borrow_mut().free(handle);
                ctx.close()
            }
        }
    }

    fn persist(&self, handle: PoolHandle) {
        let info = {
            let handlers = self.handlers.borrow();
            let Some(h) = handlers.get(handle) else {
                return;
            };
            let Some(sub) = h.subscription.as_ref() else {
                return;
            };

            SubscriptionInfo {
                fab_idx: h.fab_idx,
                node_id: h.peer_node_id,
                subscription_id: sub.id,
                min_interval: sub.min_interval,
                max_interval: sub.max_interval,
                fabric_filtered: h.fabric_filtered,
                attr_paths: h.attr_paths.clone(),
                event_paths: h.event_paths.clone(),
            }
        };

        if let Err(e) = SubscriptionStore::new(&mut *self.kv.borrow_mut()).save(&info) {
            warn!("Subscription {:x} not persisted: {:?}", info.subscription_id, e);
        }
    }

    fn forget(&self, fab_idx: u8, node_id: u64, subscription_id: u32) {
        let mut kv = self.kv.borrow_mut();
        if let Err(e) = SubscriptionStore::new(&mut *kv).delete(fab_idx, node_id, subscription_id) {
            warn!("Subscription {:x} not forgotten: {:?}", subscription_id, e);
        }
    }

    fn handle_timed_request(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let root = get_root_node_struct(rx.payload)?;
        let timeout = Duration::from_millis(root.ctx::<u16>(0)? as u64);
        let now = ctx.now();

        {
            let mut timed = self.timed.borrow_mut();
            let exchange = ctx.handle();
            timed.retain(|t| t.exchange != exchange && t.deadline + IM_RESPONSE_TIMEOUT > now);
            timed
                .push(TimedEntry {
                    exchange,
                    deadline: now + timeout,
                })
                .map_err(|_| ErrorCode::Busy)?;
        }

        debug!("Timed interaction on {:?}, {:?} to act", ctx.handle(), timeout);

        ctx.send_with(OpCode::StatusResponse, |wb| {
            write_status_response(wb, IMStatusCode::Success)
        })?;
        ctx.set_response_timeout(Some(timeout + IM_RESPONSE_TIMEOUT))
    }

    /// Consumes the timed request that preceded an action on the exchange
    /// of `ctx`, if any. Returns whether the action is timed.
    pub(super) fn take_timed(&self, ctx: &ExchangeCtx, request_timed: bool) -> Result<bool, Error> {
        let entry = {
            let mut timed = self.timed.borrow_mut();
            let exchange = ctx.handle();
            timed
                .iter()
                .position(|t| t.exchange == exchange)
                .map(|pos| timed.swap_remove(pos))
        };

        match entry {
            Some(entry) if ctx.now() > entry.deadline => Err(ErrorCode::Timeout.into()),
            Some(_) if !request_timed => Err(ErrorCode::TimedRequestMismatch.into()),
            Some(_) => Ok(true),
            None if request_timed => Err(ErrorCode::TimedRequestMismatch.into()),
            None => Ok(false),
        }
    }

    /// Keeps a timed write going over more than one chunk.
    pub(super) fn extend_timed(&self, ctx: &ExchangeCtx) -> Result<(), Error> {
        self.timed
            .borrow_mut()
            .push(TimedEntry {
                exchange: ctx.handle(),
                deadline: ctx.now() + IM_RESPONSE_TIMEOUT,
            })
            .map_err(|_| ErrorCode::Busy.into())
    }

    fn remove_timed(&self, exchange: ExchangeHandle) {
        if let Ok(mut timed) = self.timed.try_borrow_mut() {
            timed.retain(|t| t.exchange != exchange);
        }
    }

    /// Ends the exchange with a StatusResponse after a failed request.
    fn abort(&self, ctx: &mut ExchangeCtx, status: IMStatusCode) {
        let exchange = ctx.handle();
        self.remove_timed(exchange);

        if let Ok(mut handlers) = self.handlers.try_borrow_mut() {
            for handle in handlers.handles_where(|h| h.exchange == Some(exchange)) {
                handlers.free(handle);
            }
        }

        if let Err(e) =
            ctx.send_with(OpCode::StatusResponse, |wb| write_status_response(wb, status))
        {
            warn!("Could not send the status response: {:?}", e);
        }
        if let Err(e) = ctx.close() {
            warn!("Could not close the exchange: {:?}", e);
        }
    }

    fn drop_handlers_of(&self, exchange: ExchangeHandle) {
        if let Ok(mut handlers) = self.handlers.try_borrow_mut() {
            for handle in handlers.handles_where(|h| h.exchange == Some(exchange)) {
                if let Some(h) = handlers.free(handle) {
                    warn!("Report to {:x} not confirmed, dropping {:?}", h.peer_node_id, h);
                }
            }
        }
    }
}

impl ExchangeDelegate for InteractionModel<'_> {
    fn on_message_received(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let opcode = match rx.opcode::<OpCode>() {
            Ok(opcode) => opcode,
            Err(_) => {
                self.abort(ctx, IMStatusCode::InvalidAction);
                return Ok(());
            }
        };

        debug!("IM {:?} on {:?}", opcode, ctx.handle());
        if log::log_enabled!(log::Level::Trace) {
            print_tlv_list(rx.payload);
        }

        let result = match opcode {
            OpCode::ReadRequest => self.handle_read(ctx, rx),
            OpCode::SubscribeRequest => self.handle_subscribe(ctx, rx),
            OpCode::WriteRequest => self.handle_write(ctx, rx),
            OpCode::InvokeRequest => self.handle_invoke(ctx, rx),
            OpCode::TimedRequest => self.handle_timed_request(ctx, rx),
            OpCode::StatusResponse => self.handle_status_response(ctx, rx),
            _ => Err(ErrorCode::InvalidAction.into()),
        };

        if let Err(e) = result {
            warn!("IM {:?} failed: {:?}", opcode, e);
            self.abort(ctx, e.into());
        }

        Ok(())
    }

    fn on_response_timeout(&self, ctx: &mut ExchangeCtx) {
        self.remove_timed(ctx.handle());
        self.drop_handlers_of(ctx.handle());
    }

    fn on_exchange_closing(&self, exchange: ExchangeHandle) {
        self.remove_timed(exchange);
        self.drop_handlers_of(exchange);
    }
}

impl SessionReleaseListener for InteractionModel<'_> {
    fn on_session_released(&self, session: SessionHandle, _info: &Session) {
        // When the handlers are busy the next sweep catches up
        if let Ok(mut handlers) = self.handlers.try_borrow_mut() {
            for handle in handlers.handles_where(|h| h.session == session) {
                handlers.free(handle);
            }
        }
    }
}

fn parse_paths(
    root: &TLVElement,
    handler: &mut ReadHandler,
    attr_tag: u8,
    event_tag: u8,
    filter_tag: u8,
) -> Result<(), Error> {
    if let Some(paths) = root.ctx::<Option<TLVElement>>(attr_tag)? {
        for path in paths.enter()? {
            handler
                .attr_paths
                .push(AttrPath::from_tlv(&path?)?)
                .map_err(|_| ErrorCode::ResourceExhausted)?;
        }
    }

    if let Some(paths) = root.ctx::<Option<TLVElement>>(event_tag)? {
        for path in paths.enter()? {
            handler
                .event_paths
                .push(EventPath::from_tlv(&path?)?)
                .map_err(|_| ErrorCode::ResourceExhausted)?;
        }
    }

    if let Some(filters) = root.ctx::<Option<TLVElement>>(filter_tag)? {
        for filter in filters.enter()? {
            // Filters beyond capacity only cost bandwidth
            let _ = handler
                .dataver_filters
                .push(DataVersionFilter::from_tlv(&filter?)?);
        }
    }

    Ok(())
}

fn write_subscribe_response(wb: &mut WriteBuf, id: u32, max_interval: u16) -> Result<(), Error> {
    let mut tw = TLVWriter::new(wb);
    tw.start_struct(TagType::Anonymous)?;
    tw.u32(TagType::Context(0), id)?;
    tw.u16(TagType::Context(2), max_interval)?;
    tw.u8(TagType::Context(IM_REVISION_TAG), IM_REVISION)?;
    tw.end_container()
}
