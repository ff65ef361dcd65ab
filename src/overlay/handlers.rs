//! Request handlers.
//!
//! Each handler decides under the node lock whether a request is served
//! locally, from a cached orphan, or forwarded; link I/O happens after the
//! lock is released. The join handshake is the exception and holds the
//! lock until the joiner confirms.

use std::sync::Arc;

use super::node::NodeState;
use super::service::OverlayService;
use super::types::{Address, NodeId, PeerLink};
use crate::error::{OverlayError, OverlayResult};
use crate::protocol::answer::{Answer, AnswerItem};
use crate::protocol::connection::Connection;
use crate::protocol::description::NodeDescription;
use crate::protocol::message::{Request, Tag};
use crate::storage::region::Region;
use crate::storage::types::{Key, Value};

/// Runs one parsed request and writes its reply to `conn`.
///
/// Only fatal errors and failures writing to `conn` itself are returned;
/// every other failure becomes a `<tag> BAD` reply.
pub(crate) async fn dispatch(
    service: &Arc<OverlayService>,
    conn: &mut Connection,
    request: Request,
) -> OverlayResult<()> {
    let tag = request.tag();
    let query = request.to_string();

    let result = match request {
        Request::Whois => {
            let text = service.describe(false).await.to_string();
            conn.send(&text).await?;
            return Ok(());
        }
        Request::Dump => {
            let text = service.describe(true).await.to_string();
            conn.send(&text).await?;
            return Ok(());
        }
        Request::Join { joiner } => return handle_join(service, conn, joiner).await,
        Request::Depart => return handle_depart(service, conn).await,
        Request::Insert { key, value } => handle_store(service, key, value, false).await,
        Request::Append { key, value } => handle_store(service, key, value, true).await,
        Request::Lookup { key, reply, hops } => {
            handle_lookup(service, &query, key, reply, hops).await
        }
        Request::Range { lo, hi, reply, hops } => {
            handle_range(service, &query, lo, hi, reply, hops).await
        }
        Request::Nearest {
            center,
            k,
            radius,
            reply,
            hops,
            depth,
        } => {
            let search = NearestSearch {
                center,
                k,
                radius,
                reply,
                hops,
                depth,
            };
            handle_nearest(service, &query, search).await
        }
        Request::Maintenance {
            sender,
            description,
        } => handle_maintenance(service, sender, description).await,
        Request::Merge {
            target,
            description,
        } => handle_merge(service, target, description).await,
    };

    match result {
        Ok(()) => conn.send(&tag.ok()).await?,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            tracing::warn!("{} rejecting {}: {}", service.address(), query.trim_end(), e);
            conn.send(&tag.bad()).await?;
        }
    }
    Ok(())
}

enum Route {
    Local(Answer),
    Forward(usize, PeerLink),
}

fn answer_from(node: &NodeState, query: &str, hops: u32) -> Answer {
    Answer::new(query, hops, node.address(), node.id())
}

fn store(region: &mut Region, key: Key, value: Value, append: bool) -> OverlayResult<()> {
    if append {
        region.concatenate(key, value)
    } else {
        region.update(key, value)
    }
}

fn dead_route(level: usize, key: &Key) -> OverlayError {
    OverlayError::routing(format!(
        "link at level {} is down and no cached region covers ({})",
        level, key
    ))
}

async fn handle_store(
    service: &Arc<OverlayService>,
    key: Key,
    value: Value,
    append: bool,
) -> OverlayResult<()> {
    let (level, link) = {
        let mut state = service.state.lock().await;
        if state.is_relevant(&key) {
            return store(state.region_mut(), key, value, append);
        }
        let level = state
            .forward_to(&key)
            .ok_or_else(|| OverlayError::routing(format!("no node owns ({})", key)))?;
        match state.link(level) {
            Some(link) => (level, link),
            None => {
                return match state.orphan_for(&key) {
                    Some(orphan) => store(orphan.region_mut(), key, value, append),
                    None => Err(dead_route(level, &key)),
                };
            }
        }
    };

    let (tag, message) = if append {
        (Tag::Append, Request::Append { key, value })
    } else {
        (Tag::Insert, Request::Insert { key, value })
    };
    service
        .forward(level, link, &message.to_string(), tag)
        .await
}

async fn handle_lookup(
    service: &Arc<OverlayService>,
    query: &str,
    key: Key,
    reply: Address,
    hops: u32,
) -> OverlayResult<()> {
    let hops = hops.saturating_add(1);

    let route = {
        let mut state = service.state.lock().await;
        if state.is_relevant(&key) {
            Route::Local(lookup_answer(&state, query, hops, &key))
        } else {
            let level = state
                .forward_to(&key)
                .ok_or_else(|| OverlayError::routing(format!("no node owns ({})", key)))?;
            match state.link(level) {
                Some(link) => Route::Forward(level, link),
                None => match state.orphan_for(&key) {
                    Some(orphan) => Route::Local(lookup_answer(orphan, query, hops, &key)),
                    None => return Err(dead_route(level, &key)),
                },
            }
        }
    };

    match route {
        Route::Local(answer) => answer.deliver(&reply, service.receive_timeout()).await,
        Route::Forward(level, link) => {
            let message = Request::Lookup { key, reply, hops }.to_string();
            service.forward(level, link, &message, Tag::Lookup).await
        }
    }
}

fn lookup_answer(node: &NodeState, query: &str, hops: u32, key: &Key) -> Answer {
    let item = match node.region().lookup(key) {
        Some(value) => AnswerItem {
            distance: None,
            key: key.clone(),
            value: String::from_utf8_lossy(value).into_owned(),
        },
        None => AnswerItem::miss(key),
    };
    answer_from(node, query, hops).with_items([item])
}

async fn handle_range(
    service: &Arc<OverlayService>,
    query: &str,
    lo: Key,
    hi: Key,
    reply: Address,
    hops: u32,
) -> OverlayResult<()> {
    let hops = hops.saturating_add(1);
    let mut answers = Vec::new();
    let mut forwards = Vec::new();
    let mut unreachable = 0;

    {
        let state = service.state.lock().await;
        let local = state.region().range(&lo, &hi);
        if !local.is_empty() {
            answers.push(
                answer_from(&state, query, hops).with_items(local.iter().map(AnswerItem::from_entry)),
            );
        }

        for fragment in state.range_fragments(&lo, &hi) {
            if let Some(link) = state.link(fragment.level) {
                forwards.push((fragment, link));
                continue;
            }
            let covering: Vec<&NodeState> = state
                .orphans()
                .iter()
                .filter(|o| o.region().intersects(&fragment.lo, &fragment.hi))
                .collect();
            if covering.is_empty() {
                tracing::warn!(
                    "{} cannot reach level {} for range fragment",
                    service.address(),
                    fragment.level
                );
                unreachable += 1;
            }
            for orphan in covering {
                let found = orphan.region().range(&fragment.lo, &fragment.hi);
                if !found.is_empty() {
                    answers.push(
                        answer_from(orphan, query, hops)
                            .with_items(found.iter().map(AnswerItem::from_entry)),
                    );
                }
            }
        }
    }

    let mut failed = unreachable + deliver_all(service, &answers, &reply).await;
    for (fragment, link) in forwards {
        let message = Request::Range {
            lo: fragment.lo,
            hi: fragment.hi,
            reply: reply.clone(),
            hops,
        }
        .to_string();
        if let Err(e) = service.forward(fragment.level, link, &message, Tag::Range).await {
            tracing::warn!("Range fragment at level {} failed: {}", fragment.level, e);
            failed += 1;
        }
    }

    if failed > 0 {
        return Err(OverlayError::routing(format!(
            "{} range answer(s) or fragment(s) could not be delivered",
            failed
        )));
    }
    Ok(())
}

/// Pushes every answer to `reply`, returning how many could not be delivered.
async fn deliver_all(service: &Arc<OverlayService>, answers: &[Answer], reply: &Address) -> usize {
    let mut failed = 0;
    for answer in answers {
        if let Err(e) = answer.deliver(reply, service.receive_timeout()).await {
            tracing::warn!("Answer from node {:?} to {} lost: {}", answer.id.0, reply, e);
            failed += 1;
        }
    }
    failed
}

struct NearestSearch {
    center: Key,
    k: usize,
    radius: f64,
    reply: Address,
    hops: u32,
    depth: usize,
}

async fn handle_nearest(
    service: &Arc<OverlayService>,
    query: &str,
    search: NearestSearch,
) -> OverlayResult<()> {
    let NearestSearch {
        center,
        k,
        mut radius,
        reply,
        hops,
        depth,
    } = search;
    let hops = hops.saturating_add(1);
    if k == 0 {
        return Ok(());
    }

    let mut answers = Vec::new();
    let mut forwards = Vec::new();
    let mut unreachable = 0;

    {
        let state = service.state.lock().await;

        let mut searched_orphan = None;
        if radius < 0.0 {
            if state.is_relevant(&center) {
                radius = f64::INFINITY;
            } else {
                // Route towards the owner of the center first.
                let level = state
                    .forward_to(&center)
                    .ok_or_else(|| OverlayError::routing(format!("no node owns ({})", center)))?;
                let link = state.link(level);
                match link {
                    Some(link) => {
                        drop(state);
                        let message = Request::Nearest {
                            center,
                            k,
                            radius,
                            reply,
                            hops,
                            depth,
                        }
                        .to_string();
                        return service.forward(level, link, &message, Tag::Nearest).await;
                    }
                    None => {
                        let index = state
                            .orphans()
                            .iter()
                            .position(|o| o.is_relevant(&center))
                            .ok_or_else(|| dead_route(level, &center))?;
                        let orphan = &state.orphans()[index];
                        let (found, reach) = orphan.region().nearest(&center, k, f64::INFINITY);
                        radius = if found.len() == k { reach } else { f64::INFINITY };
                        if !found.is_empty() {
                            answers.push(
                                answer_from(orphan, query, hops)
                                    .with_items(found.iter().map(AnswerItem::from_neighbor)),
                            );
                        }
                        searched_orphan = Some(index);
                    }
                }
            }
        }

        let (found, reach) = state.region().nearest(&center, k, radius);
        // Only a full result set bounds where the true neighbours can be.
        if found.len() == k && reach < radius {
            radius = reach;
        }
        if !found.is_empty() {
            answers.push(
                answer_from(&state, query, hops)
                    .with_items(found.iter().map(AnswerItem::from_neighbor)),
            );
        }

        let dims = center.dims();
        let ball_lo = Key::new((0..dims).map(|j| center[j] - radius).collect());
        let ball_hi = Key::new((0..dims).map(|j| center[j] + radius).collect());
        for level in state.nearest_levels(&center, radius, depth) {
            if let Some(link) = state.link(level) {
                forwards.push((level, link));
                continue;
            }
            let mut served = false;
            for (index, orphan) in state.orphans().iter().enumerate() {
                if !orphan.region().intersects(&ball_lo, &ball_hi) {
                    continue;
                }
                served = true;
                if searched_orphan == Some(index) {
                    continue;
                }
                let (found, _) = orphan.region().nearest(&center, k, radius);
                if !found.is_empty() {
                    answers.push(
                        answer_from(orphan, query, hops)
                            .with_items(found.iter().map(AnswerItem::from_neighbor)),
                    );
                }
            }
            if !served {
                unreachable += 1;
            }
        }
    }

    let mut failed = unreachable + deliver_all(service, &answers, &reply).await;
    for (level, link) in forwards {
        let message = Request::Nearest {
            center: center.clone(),
            k,
            radius,
            reply: reply.clone(),
            hops,
            depth: level + 1,
        }
        .to_string();
        if let Err(e) = service.forward(level, link, &message, Tag::Nearest).await {
            tracing::warn!("Nearest-neighbour forward at level {} failed: {}", level, e);
            failed += 1;
        }
    }

    if failed > 0 {
        return Err(OverlayError::routing(format!(
            "{} nearest-neighbour branch(es) could not be searched",
            failed
        )));
    }
    Ok(())
}

/// Sends an `O` announcement of `description` over every live link from
/// `from_level` on, except towards the subtree the description names.
/// Returns how many links failed.
pub(crate) async fn announce(
    service: &Arc<OverlayService>,
    description: NodeDescription,
    from_level: usize,
) -> usize {
    let (sender, targets) = {
        let state = service.state.lock().await;
        let targets: Vec<(usize, PeerLink)> = state
            .live_links()
            .into_iter()
            .filter(|(level, _)| *level >= from_level && state.level_id(*level) != description.id)
            .collect();
        (state.id(), targets)
    };

    let message = Request::Maintenance {
        sender,
        description,
    }
    .to_string();
    let mut failed = 0;
    for (level, link) in targets {
        if let Err(e) = service.forward(level, link, &message, Tag::Maintenance).await {
            tracing::warn!("Announcement over level {} failed: {}", level, e);
            failed += 1;
        }
    }
    failed
}

async fn handle_maintenance(
    service: &Arc<OverlayService>,
    sender: NodeId,
    description: NodeDescription,
) -> OverlayResult<()> {
    let (replace, from_level) = {
        let state = service.state.lock().await;
        let own = state.id();
        let shared = own.common_prefix_len(&description.id);
        let replace = (description.id != own
            && shared < state.depth()
            && shared < description.id.len())
            .then(|| (shared, description.address.clone()));
        (replace, own.common_prefix_len(&sender) + 1)
    };

    if let Some((level, address)) = replace {
        tracing::info!(
            "{} now reaches level {} through {}",
            service.address(),
            level,
            address
        );
        let link = match Connection::open(&address, service.receive_timeout()).await {
            Ok(conn) => Some(Arc::new(tokio::sync::Mutex::new(conn))),
            Err(e) => {
                tracing::warn!("Unable to link level {} to {}: {}", level, address, e);
                None
            }
        };
        service
            .state
            .lock()
            .await
            .replace_sibling(level, address, link);
    }

    announce(service, description, from_level).await;
    Ok(())
}

async fn handle_merge(
    service: &Arc<OverlayService>,
    target: NodeId,
    description: NodeDescription,
) -> OverlayResult<()> {
    let departing = description.address.clone();
    let incoming = NodeState::from_description(description)?;

    let (own_description, orphan_description) = {
        let mut state = service.state.lock().await;
        if target == state.id() {
            state.merge(incoming)?;
            tracing::info!(
                "{} absorbed departing node {}, now node {:?}",
                service.address(),
                departing,
                state.id().0
            );
            (Some(state.describe(false)), None)
        } else {
            let mut orphan = incoming;
            orphan.set_address(service.address().clone());
            tracing::info!(
                "{} caching orphaned region {:?} of {}",
                service.address(),
                orphan.id().0,
                departing
            );
            for level in 0..state.depth() {
                if state.splits()[level].sibling == departing {
                    state.set_link(level, None);
                }
            }
            let description = orphan.describe(false);
            state.push_orphan(orphan);
            (None, Some(description))
        }
    };

    if let Some(description) = own_description {
        announce(service, description, 0).await;
    }
    if let Some(description) = orphan_description {
        let failed = announce(service, description, 0).await;
        if failed > 0 {
            return Err(OverlayError::routing(format!(
                "{} orphan announcement(s) failed",
                failed
            )));
        }
    }
    Ok(())
}

async fn handle_join(
    service: &Arc<OverlayService>,
    conn: &mut Connection,
    joiner: Address,
) -> OverlayResult<()> {
    let mut state = service.state.lock().await;

    if let Some(mut orphan) = state.pop_orphan() {
        orphan.set_address(joiner.clone());
        let confirmed = handshake(conn, &orphan).await;
        if !confirmed {
            orphan.set_address(service.address().clone());
            state.push_orphan(orphan);
            return Ok(());
        }
        tracing::info!(
            "{} handed orphaned region {:?} to {}",
            service.address(),
            orphan.id().0,
            joiner
        );
        let level = state.id().common_prefix_len(&orphan.id());
        if level < state.depth() && state.link(level).is_none() {
            state.replace_sibling(level, joiner.clone(), None);
            link_level(service, &mut state, level).await;
        }
        drop(state);
        announce(service, orphan.describe(false), 0).await;
        return Ok(());
    }

    let sibling = state.split(joiner.clone());
    if handshake(conn, &sibling).await {
        tracing::info!(
            "{} split for {}, keeping [({}), ({}))",
            service.address(),
            joiner,
            state.region().lo(),
            state.region().hi()
        );
        let level = state.depth() - 1;
        link_level(service, &mut state, level).await;
    } else {
        state.merge(sibling)?;
    }
    Ok(())
}

/// Connects split `level` to its sibling while the caller holds the lock,
/// so requests queued behind the lock already see the link.
async fn link_level(service: &Arc<OverlayService>, state: &mut NodeState, level: usize) {
    let sibling = match state.splits().get(level) {
        Some(split) => split.sibling.clone(),
        None => return,
    };
    match Connection::open(&sibling, service.receive_timeout()).await {
        Ok(conn) => state.set_link(level, Some(Arc::new(tokio::sync::Mutex::new(conn)))),
        Err(e) => tracing::warn!("Unable to link level {} to {}: {}", level, sibling, e),
    }
}

/// Sends `node`'s description with data and waits for `S OK`.
async fn handshake(conn: &mut Connection, node: &NodeState) -> bool {
    let description = node.describe(true).to_string();
    let reply = match conn.send(&description).await {
        Ok(()) => conn.recv_reply().await,
        Err(e) => Err(e),
    };
    match reply {
        Ok(reply) if Tag::Join.is_ok_reply(&reply) => true,
        Ok(reply) => {
            tracing::warn!("Joiner {} declined: {}", conn.peer(), reply);
            false
        }
        Err(e) => {
            tracing::warn!("Join handshake with {} failed: {}", conn.peer(), e);
            false
        }
    }
}

async fn handle_depart(service: &Arc<OverlayService>, conn: &mut Connection) -> OverlayResult<()> {
    service.leave().await;
    conn.send(&Tag::Depart.ok()).await?;
    Ok(())
}
