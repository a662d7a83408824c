//! Leveled diagnostic report.
//!
//! | level | adds |
//! |-------|------|
//! | 0 | version line and client count |
//! | 1 | one block per client, interfaces, beacon destinations, ignore list |
//! | 2 | channel names with event counts and rights, UDP session detail |
//! | 3 | timing, unprocessed and undelivered bytes, buffer classes |
//! | 4 | free-list statistics and the registry table size |

use std::fmt::Write;

use pv_core::protocol::{MAJOR_PROTOCOL_REVISION, MINOR_PROTOCOL_REVISION};

use super::context::ServerContext;
use super::session::{Session, Transport};

/// Renders the report at `level`.
pub fn report(ctx: &ServerContext, level: u32) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = write_report(&mut out, ctx, level);
    out
}

fn write_report(out: &mut String, ctx: &ServerContext, level: u32) -> std::fmt::Result {
    let sessions = ctx.registry().sessions();
    let (tcp, udp): (Vec<_>, Vec<_>) = sessions.iter().partition(|s| s.transport() == Transport::Tcp);

    writeln!(
        out,
        "PV access server V{MAJOR_PROTOCOL_REVISION}.{MINOR_PROTOCOL_REVISION} ({} state, port {})",
        format!("{:?}", ctx.control_state()).to_lowercase(),
        ctx.server_port()
    )?;
    if tcp.is_empty() {
        writeln!(out, "No clients connected.")?;
    } else {
        writeln!(out, "Connected circuits: {}", tcp.len())?;
    }

    for session in &tcp {
        if level == 0 {
            let identity = session.identity();
            writeln!(
                out,
                "  {}({}): {} {} channels",
                identity.host,
                identity.user,
                session.peer(),
                session.channel_count()
            )?;
        } else {
            write_session(out, session, level)?;
        }
    }
    if level == 0 {
        return Ok(());
    }

    let network = ctx.network();
    writeln!(out, "Discovery accepts {}", network.family_policy)?;
    for (n, intf) in network.interfaces.iter().enumerate() {
        write!(out, "Interface {n}: TCP {} UDP {}", intf.tcp, intf.udp)?;
        match intf.broadcast {
            Some(bcast) => writeln!(out, " broadcast {bcast}")?,
            None => writeln!(out)?,
        }
    }
    writeln!(out, "Beacon destinations:")?;
    for addr in &network.beacon_addresses {
        writeln!(out, "  {addr}")?;
    }
    if network.ignore_list.is_empty() {
        writeln!(out, "No ignored addresses.")?;
    } else {
        writeln!(out, "Ignoring requests from:")?;
        for addr in &network.ignore_list {
            writeln!(out, "  {addr}")?;
        }
    }

    if level >= 2 {
        for session in &udp {
            write_session(out, session, level)?;
        }
    }

    if level >= 4 {
        writeln!(out, "Free lists:")?;
        for stats in ctx.registry().pool_stats() {
            let limit = stats.limit.map_or_else(|| "none".to_string(), |l| l.to_string());
            writeln!(
                out,
                "  {:<14} outstanding {:>6} free {:>6} limit {limit}",
                stats.name, stats.outstanding, stats.free
            )?;
        }
        let (channels, circuits) = ctx.stats();
        writeln!(
            out,
            "Server id table: {} slots, {channels} channels, {circuits} circuits",
            ctx.registry().table_capacity()
        )?;
    }
    Ok(())
}

fn write_session(out: &mut String, session: &Session, level: u32) -> std::fmt::Result {
    let identity = session.identity();
    match session.transport() {
        Transport::Tcp => writeln!(
            out,
            "TCP client at {} '{}' user '{}': V4.{} priority {} channels {}",
            session.peer(),
            identity.host,
            identity.user,
            session.minor_version(),
            session.priority(),
            session.channel_count()
        )?,
        Transport::Udp => writeln!(
            out,
            "UDP server at {}: last name requested by {}: '{}', {} provisional channels",
            session.peer(),
            session.send().reply_to().map_or_else(|| "nobody".to_string(), |a| a.to_string()),
            session.last_search(),
            session.channel_count()
        )?,
    }

    if level >= 3 {
        writeln!(
            out,
            "  {:.1} s since last send, {:.1} s since last receive",
            session.since_last_send().as_secs_f64(),
            session.since_last_recv().as_secs_f64()
        )?;
        writeln!(
            out,
            "  unprocessed request bytes {}, undelivered response bytes {}, backlog {}",
            session.recv_pending(),
            session.undelivered_bytes(),
            session.backlog()
        )?;
        writeln!(
            out,
            "  send buffer {:?}, {} queued updates, flow control {}",
            session.send_buffer_class(),
            session.pending_event_count(),
            if session.is_flow_controlled() { "on" } else { "off" }
        )?;
    }

    if level >= 2 && session.transport() == Transport::Tcp {
        let channels = session.channels().all();
        for chan in channels {
            writeln!(
                out,
                "    {} ({} events, {})",
                chan.name(),
                chan.event_count(),
                chan.effective_rights().as_report_str()
            )?;
        }
    }
    Ok(())
}
