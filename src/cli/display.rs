use colored::*;
use prettytable::{format, Cell, Row, Table};

use crate::api::{NeighborSnapshot, RouteSnapshot};
use crate::utils::{format_elapsed_time, u32_to_dotted};

fn base_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_format(
        format::FormatBuilder::new()
            .column_separator(' ')
            .borders(' ')
            .padding(1, 1)
            .build(),
    );
    table.set_titles(Row::new(
        headers.iter().map(|h| Cell::new(&h.bold())).collect(),
    ));
    table
}

fn seconds_to_elapsed(seconds: i64) -> String {
    if seconds == 0 {
        String::new()
    } else {
        format_elapsed_time(chrono::Duration::seconds(seconds))
    }
}

pub fn neighbor_table(neighbors: &[NeighborSnapshot]) -> Table {
    let mut table = base_table(&[
        "Neighbor", "Router ID", "AS", "MsgRcvd", "MsgSent", "Uptime", "State", "PfxRcd", "OutQ",
        "Flaps",
    ]);
    for neighbor in neighbors {
        let disabled = if neighbor.info.enabled { "" } else { "*" };
        table.add_row(Row::new(vec![
            Cell::new(&format!("{}{}", disabled, neighbor.conf.remote_ip)),
            Cell::new(
                &neighbor
                    .conf
                    .remote_router_id
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
            ),
            Cell::new(&u32_to_dotted(neighbor.conf.remote_as, '.')),
            Cell::new(&neighbor.info.received.total().to_string()),
            Cell::new(&neighbor.info.sent.total().to_string()),
            Cell::new(&seconds_to_elapsed(neighbor.info.uptime)),
            Cell::new(&neighbor.info.state),
            Cell::new(&neighbor.info.prefixes_received.to_string()),
            Cell::new(&neighbor.info.out_q.to_string()),
            Cell::new(&neighbor.info.flops.to_string()),
        ]));
    }
    table
}

pub fn neighbor_detail(neighbor: &NeighborSnapshot) -> String {
    let mut lines: Vec<String> = Vec::with_capacity(16);
    lines.push(format!(
        "BGP neighbor is {},  remote AS {}, local AS {}",
        neighbor.conf.remote_ip,
        u32_to_dotted(neighbor.conf.remote_as, '.'),
        u32_to_dotted(neighbor.conf.local_as, '.'),
    ));
    if !neighbor.info.enabled {
        lines.push("*Peer is Disabled".to_string());
    }
    if let Some(router_id) = neighbor.conf.remote_router_id {
        lines.push(format!("BGP version 4,  remote router-id {}", router_id));
    }
    if let Some(local) = neighbor.info.local_addr {
        lines.push(format!("  Local address: {}", local));
    }
    lines.push(format!(
        "BGP state = {}, up for {}",
        neighbor.info.state,
        seconds_to_elapsed(neighbor.info.uptime),
    ));
    lines.push(format!(
        "Hold time is {}, keepalive interval is {}",
        neighbor.info.negotiated_hold_time,
        neighbor.info.negotiated_hold_time / 3,
    ));
    lines.push(format!(
        "Established transitions {}, flaps {}",
        neighbor.info.established_transitions, neighbor.info.flops,
    ));
    lines.push("Neighbor capability codes:".to_string());
    lines.push(format!("  remote: {:?}", neighbor.conf.remote_capabilities));
    lines.push(format!("  local:  {:?}", neighbor.conf.local_capabilities));
    lines.push("Message Statistics:".to_string());
    lines.push("                    Sent      Received".to_string());
    lines.push(format!(
        "  Opens             {:<9} {}",
        neighbor.info.sent.open, neighbor.info.received.open
    ));
    lines.push(format!(
        "  Updates           {:<9} {}",
        neighbor.info.sent.update, neighbor.info.received.update
    ));
    lines.push(format!(
        "  Keepalives        {:<9} {}",
        neighbor.info.sent.keepalive, neighbor.info.received.keepalive
    ));
    lines.push(format!(
        "  Notifications     {:<9} {}",
        neighbor.info.sent.notification, neighbor.info.received.notification
    ));
    lines.push(format!(
        "  Route Refreshes   {:<9} {}",
        neighbor.info.sent.refresh, neighbor.info.received.refresh
    ));
    lines.push(format!(
        "  Total             {:<9} {}",
        neighbor.info.sent.total(),
        neighbor.info.received.total()
    ));
    lines.push(format!(
        "Prefixes: {} received, {} accepted, {} advertised [OutQ {}]",
        neighbor.info.prefixes_received,
        neighbor.info.prefixes_accepted,
        neighbor.info.prefixes_advertised,
        neighbor.info.out_q,
    ));
    lines.join("\n  ")
}

pub fn route_table(routes: &[RouteSnapshot]) -> Table {
    let mut table = base_table(&[
        "Source",
        "Prefix",
        "Next Hop",
        "Origin",
        "AS Path",
        "Local Pref",
        "Metric",
        "Age",
    ]);
    for route in routes {
        table.add_row(Row::new(vec![
            Cell::new(&route.source),
            Cell::new(&route.prefix),
            Cell::new(
                &route
                    .next_hop
                    .map(|nh| nh.to_string())
                    .unwrap_or_default(),
            ),
            Cell::new(&route.origin),
            Cell::new(&route.as_path),
            Cell::new(
                &route
                    .local_pref
                    .map(|lp| lp.to_string())
                    .unwrap_or_default(),
            ),
            Cell::new(
                &route
                    .multi_exit_disc
                    .map(|med| med.to_string())
                    .unwrap_or_default(),
            ),
            Cell::new(&route.age),
        ]));
    }
    table
}
