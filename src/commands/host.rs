//! Host Commands
//!
//! The server-level commands around the MDB layer: liveness, introspection,
//! persistence and replication role.

use crate::commands::handler::Context;
use crate::protocol::{Reply, RespValue};
use crate::server::{self, Role};
use bytes::Bytes;
use std::fmt::Write as _;
use tracing::warn;

/// PING [message]
pub fn ping(_ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    match argv.len() {
        1 => reply.status("PONG"),
        2 => reply.bulk(argv[1].clone()),
        _ => reply.error("ERR wrong number of arguments for 'ping' command"),
    }
}

/// ECHO message
pub fn echo(_ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    reply.bulk(argv[1].clone());
}

/// QUIT
pub fn quit(ctx: &mut Context<'_>, _argv: &[Bytes], reply: &mut Reply) {
    reply.ok();
    ctx.request_quit();
}

/// COMMAND [COUNT]
pub fn command(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    match argv.get(1) {
        None => {
            let rows = ctx
                .table
                .specs()
                .into_iter()
                .map(|spec| {
                    RespValue::array(vec![
                        RespValue::bulk_string(Bytes::from_static(spec.name.as_bytes())),
                        RespValue::integer(i64::from(spec.arity)),
                        RespValue::array(vec![RespValue::simple_string(spec.kind.flag())]),
                    ])
                })
                .collect();
            reply.add(RespValue::array(rows));
        }
        Some(sub) if sub.eq_ignore_ascii_case(b"count") && argv.len() == 2 => {
            reply.integer(ctx.table.len() as i64)
        }
        Some(sub) => reply.error(format!(
            "ERR Unknown COMMAND subcommand or wrong number of arguments for '{}'",
            String::from_utf8_lossy(sub)
        )),
    }
}

/// SAVE
pub fn save(ctx: &mut Context<'_>, _argv: &[Bytes], reply: &mut Reply) {
    match server::save_rdb(ctx.state) {
        Ok(_) => reply.ok(),
        Err(err) => {
            warn!(error = %err, "SAVE failed");
            reply.error(format!("ERR {}", err));
        }
    }
}

/// DBSIZE
///
/// The MDB keyspace is the only one this server keeps.
pub fn dbsize(ctx: &mut Context<'_>, _argv: &[Bytes], reply: &mut Reply) {
    if !ctx.state.store.is_enabled() {
        reply.integer(0);
        return;
    }
    ctx.state.store.read("dbsize", reply, |txn, reply| {
        reply.integer(txn.entries()? as i64);
        Ok(())
    });
}

/// ROLE
pub fn role(ctx: &mut Context<'_>, _argv: &[Bytes], reply: &mut Reply) {
    let host = &ctx.state.host;
    let offset = host.backlog().offset() as i64;
    let role = RespValue::bulk_string(Bytes::from_static(host.role().as_str().as_bytes()));
    let value = match host.role() {
        Role::Master => RespValue::array(vec![
            role,
            RespValue::integer(offset),
            RespValue::array(Vec::new()),
        ]),
        Role::Replica => RespValue::array(vec![
            role,
            RespValue::bulk_string(Bytes::new()),
            RespValue::integer(0),
            RespValue::bulk_string(Bytes::from_static(b"connected")),
            RespValue::integer(offset),
        ]),
    };
    reply.add(value);
}

const SECTIONS: &[&str] = &[
    "server",
    "clients",
    "stats",
    "persistence",
    "replication",
    "mdb",
];

/// INFO [section]
pub fn info(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    if argv.len() > 2 {
        reply.error("ERR syntax error");
        return;
    }
    let wanted = argv
        .get(1)
        .map(|s| String::from_utf8_lossy(s).to_ascii_lowercase());

    let mut out = String::new();
    for section in SECTIONS {
        let selected = match wanted.as_deref() {
            None | Some("all") | Some("default") | Some("everything") => true,
            Some(name) => name == *section,
        };
        if !selected {
            continue;
        }
        if !out.is_empty() {
            out.push_str("\r\n");
        }
        write_section(ctx, section, &mut out);
    }
    reply.bulk(out);
}

fn write_section(ctx: &Context<'_>, section: &str, out: &mut String) {
    let state = &*ctx.state;
    let stats = state.stats.snapshot();
    // Writing into a String cannot fail.
    let _ = match section {
        "server" => write!(
            out,
            "# Server\r\n\
             flashmdb_version:{}\r\n\
             os:{}\r\n\
             process_id:{}\r\n\
             tcp_port:{}\r\n\
             uptime_in_seconds:{}\r\n\
             hz:{}\r\n",
            crate::VERSION,
            std::env::consts::OS,
            std::process::id(),
            state.config.port,
            state.start_time.elapsed().as_secs(),
            state.config.hz,
        ),
        "clients" => write!(
            out,
            "# Clients\r\n\
             connected_clients:{}\r\n",
            stats.active,
        ),
        "stats" => write!(
            out,
            "# Stats\r\n\
             total_connections_received:{}\r\n\
             total_commands_processed:{}\r\n\
             total_net_input_bytes:{}\r\n\
             total_net_output_bytes:{}\r\n",
            stats.accepted,
            stats.commands,
            stats.bytes_in,
            stats.bytes_out,
        ),
        "persistence" => write!(
            out,
            "# Persistence\r\n\
             loading:{}\r\n\
             rdb_changes_since_last_save:{}\r\n\
             rdb_last_save_time:{}\r\n\
             rdb_last_save_status:{}\r\n",
            u8::from(state.loading),
            state.host.dirty(),
            state.host.last_save().unwrap_or(0),
            if state.host.last_save_ok() { "ok" } else { "err" },
        ),
        "replication" => write!(
            out,
            "# Replication\r\n\
             role:{}\r\n\
             master_repl_offset:{}\r\n\
             repl_backlog_histlen:{}\r\n",
            state.host.role().as_str(),
            state.host.backlog().offset(),
            state.host.backlog().len(),
        ),
        "mdb" => write_mdb_section(ctx, out),
        _ => Ok(()),
    };
}

fn write_mdb_section(ctx: &Context<'_>, out: &mut String) -> std::fmt::Result {
    let store = &ctx.state.store;
    out.push_str("# MDB\r\n");
    write!(
        out,
        "mdb_enabled:{}\r\nmdb_backend:{}\r\n",
        u8::from(store.is_enabled()),
        store.backend().name(),
    )?;

    let figures = store
        .engine()
        .and_then(|engine| Ok((engine.info()?, engine.read_txn()?.entries()?)));
    if let Ok((info, keys)) = figures {
        write!(
            out,
            "mdb_map_size:{}\r\n\
             mdb_readers:{}\r\n\
             mdb_max_readers:{}\r\n\
             mdb_keys:{}\r\n",
            info.map_size, info.readers, info.max_readers, keys,
        )?;
    }

    write!(
        out,
        "mdb_expire_interval_us:{}\r\n\
         mdb_expire_exceedance:{:.2}\r\n",
        store.controller.interval_us(),
        store.controller.exceedance(),
    )
}
