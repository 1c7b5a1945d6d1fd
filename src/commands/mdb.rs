//! MDB Command Layer
//!
//! The `MM*` commands. Each one runs inside exactly one transaction from
//! [`crate::storage::txn`]:
//!
//! - readers (`MMGET`, `MMTTL`, `MMKEYS`, ...) use a read transaction that is
//!   gone before the reply leaves the server;
//! - writers (`MMSET`, `MMINCRBY`, `MMEXPIRE`, ...) read, validate, compute
//!   and write in one read-write transaction, commit, and only then reply.
//!   Validation failures reply and return [`Rollback`].
//!
//! A record past its expiration is treated as absent by every command.
//! Readers that run into one note it on the [`Context`]; the dispatcher
//! deletes it afterwards and propagates `MMDEL`.

use crate::commands::glob::GlobPattern;
use crate::commands::handler::{parse_i64, Context, NOT_AN_INTEGER};
use crate::protocol::Reply;
use crate::storage::codec::{self, StoredValue};
use crate::storage::engine::CursorOp;
use crate::storage::store::{Host, Lookup};
use crate::storage::txn::Rollback;
use bytes::Bytes;

const SYNTAX_ERROR: &str = "ERR syntax error";

/// Decodes a raw record, dropping it if it has expired.
fn live(raw: Option<&[u8]>, shallow: bool, now_ms: i64) -> Option<StoredValue> {
    Lookup::classify(raw, shallow, now_ms).live()
}

/// Looks `key` up in a read-only transaction and hands the live value, if
/// any, to `op`.
fn read_key<F>(ctx: &mut Context<'_>, cmd: &str, key: &Bytes, shallow: bool, reply: &mut Reply, op: F)
where
    F: FnOnce(Option<&StoredValue>, &mut Reply),
{
    let now = ctx.now_ms;
    let found_expired = ctx.state.store.read(cmd, reply, |txn, reply| {
        let lookup = Lookup::classify(txn.get(key)?, shallow, now);
        let expired = lookup == Lookup::Expired;
        op(lookup.live().as_ref(), reply);
        Ok(expired)
    });
    if found_expired == Some(true) {
        ctx.note_expired(key);
    }
}

// ============================================================================
// Reads
// ============================================================================

/// MMGET key
pub fn get(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    read_key(ctx, "mmget", &argv[1], false, reply, |value, reply| match value {
        Some(value) => reply.bulk(Bytes::copy_from_slice(value.bytes())),
        None => reply.null(),
    });
}

/// MMEXISTS key
pub fn exists(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    read_key(ctx, "mmexists", &argv[1], true, reply, |value, reply| {
        reply.integer(i64::from(value.is_some()))
    });
}

/// MMTYPE key
pub fn type_of(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    read_key(ctx, "mmtype", &argv[1], true, reply, |value, reply| {
        reply.status(value.map_or("none", |v| v.value_type.as_str()))
    });
}

/// MMSTRLEN key
pub fn strlen(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    read_key(ctx, "mmstrlen", &argv[1], true, reply, |value, reply| {
        reply.integer(value.map_or(0, |v| v.len as i64))
    });
}

/// MMTTL key
pub fn ttl(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    ttl_generic(ctx, argv, reply, "mmttl", false);
}

/// MMPTTL key
pub fn pttl(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    ttl_generic(ctx, argv, reply, "mmpttl", true);
}

/// A missing key and a key without expiration both reply -1.
fn ttl_generic(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply, cmd: &str, in_ms: bool) {
    let now = ctx.now_ms;
    read_key(ctx, cmd, &argv[1], true, reply, |value, reply| {
        let remaining = value
            .and_then(|v| v.expire_at)
            .map(|at| at - now)
            .filter(|ttl| *ttl >= 0);
        match remaining {
            Some(ttl) if in_ms => reply.integer(ttl),
            Some(ttl) => reply.integer((ttl + 500) / 1000),
            None => reply.integer(-1),
        }
    });
}

/// MMGETRANGE key start end
pub fn getrange(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    let (Some(start), Some(end)) = (parse_i64(&argv[2]), parse_i64(&argv[3])) else {
        reply.error(NOT_AN_INTEGER);
        return;
    };

    read_key(ctx, "mmgetrange", &argv[1], false, reply, |value, reply| {
        let range = value.and_then(|v| clamp_range(start, end, v.len).map(|r| (v, r)));
        match range {
            Some((value, (from, to))) => reply.bulk(Bytes::copy_from_slice(&value.bytes()[from..=to])),
            None => reply.bulk(Bytes::new()),
        }
    });
}

/// Resolves GETRANGE indices against a string of `len` bytes. Negative
/// indices count from the end; both ends are clamped into the string.
/// `None` means the range is empty.
pub fn clamp_range(start: i64, end: i64, len: usize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let from_end = |i: i64| if i < 0 { len + i } else { i };
    let start = from_end(start).max(0);
    let end = from_end(end).max(0).min(len - 1);
    if start > end {
        None
    } else {
        Some((start as usize, end as usize))
    }
}

/// MMKEYS pattern
pub fn keys(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    let pattern = GlobPattern::new(&argv[1]);
    let all = pattern.matches_all();
    let now = ctx.now_ms;

    ctx.state.store.read("mmkeys", reply, |txn, reply| {
        let slot = reply.add_deferred_len();
        let mut matched = 0;

        let mut cursor = txn.cursor()?;
        let mut entry = cursor.get(CursorOp::First)?;
        while let Some((key, raw)) = entry {
            if (all || pattern.matches(key)) && !codec::decode(raw, true).is_expired(now) {
                reply.bulk(Bytes::copy_from_slice(key));
                matched += 1;
            }
            entry = cursor.get(CursorOp::Next)?;
        }

        reply.set_deferred_len(slot, matched);
        Ok(())
    });
}

/// MMDBSIZE
pub fn dbsize(ctx: &mut Context<'_>, _argv: &[Bytes], reply: &mut Reply) {
    ctx.state.store.read("mmdbsize", reply, |txn, reply| {
        reply.integer(txn.entries()? as i64);
        Ok(())
    });
}

/// MMINFO
pub fn info(ctx: &mut Context<'_>, _argv: &[Bytes], reply: &mut Reply) {
    let store = &ctx.state.store;
    store.read("mminfo", reply, |txn, reply| {
        let info = store.engine()?.info()?;
        reply.status(format!(
            "MDBInfo mapsize:{} readers:{}/{} main:{}",
            info.map_size,
            info.readers,
            info.max_readers,
            txn.entries()?
        ));
        Ok(())
    });
}

/// MMDEBUG OBJECT key
pub fn debug(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    if !(argv[1].eq_ignore_ascii_case(b"object") && argv.len() == 3) {
        reply.error(format!(
            "ERR Unknown MMDEBUG subcommand or wrong number of arguments for '{}'",
            String::from_utf8_lossy(&argv[1])
        ));
        return;
    }

    read_key(ctx, "mmdebug", &argv[2], true, reply, |value, reply| match value {
        Some(value) => reply.status(format!(
            "Value type:{} encoding:{} length:{} expiration:{}",
            value.value_type.as_str(),
            value.encoding.as_str(),
            value.len,
            value.expire_at.unwrap_or(-1)
        )),
        None => reply.error("ERR no such key"),
    });
}

// ============================================================================
// Writes
// ============================================================================

#[derive(Debug, Default, PartialEq, Eq)]
struct SetOptions {
    nx: bool,
    xx: bool,
    expire_at: Option<i64>,
}

/// Parses `[NX|XX] [EX seconds|PX milliseconds]` in any order and case.
fn parse_set_options(args: &[Bytes], now_ms: i64) -> Result<SetOptions, String> {
    let invalid_expire = || "ERR invalid expire time in 'mmset' command".to_string();
    let mut opts = SetOptions::default();

    let mut i = 0;
    while i < args.len() {
        let token = &args[i];
        let next = args.get(i + 1);
        if token.eq_ignore_ascii_case(b"nx") {
            opts.nx = true;
        } else if token.eq_ignore_ascii_case(b"xx") {
            opts.xx = true;
        } else if let (true, Some(amount)) = (token.eq_ignore_ascii_case(b"ex"), next) {
            let ms = parse_i64(amount)
                .filter(|secs| *secs > 0)
                .and_then(|secs| secs.checked_mul(1000))
                .ok_or_else(invalid_expire)?;
            opts.expire_at = Some(now_ms.checked_add(ms).ok_or_else(invalid_expire)?);
            i += 1;
        } else if let (true, Some(amount)) = (token.eq_ignore_ascii_case(b"px"), next) {
            let ms = parse_i64(amount)
                .filter(|ms| *ms > 0)
                .ok_or_else(invalid_expire)?;
            opts.expire_at = Some(now_ms.checked_add(ms).ok_or_else(invalid_expire)?);
            i += 1;
        } else {
            return Err(SYNTAX_ERROR.to_string());
        }
        i += 1;
    }
    Ok(opts)
}

/// MMSET key value [NX|XX] [EX seconds|PX milliseconds]
pub fn set(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    let now = ctx.now_ms;
    let opts = match parse_set_options(&argv[3..], now) {
        Ok(opts) => opts,
        Err(msg) => {
            reply.error(msg);
            return;
        }
    };
    let (key, value) = (&argv[1], &argv[2]);

    let done = ctx.state.store.write("mmset", reply, |txn, reply| {
        if opts.nx || opts.xx {
            let exists = live(txn.get(key)?, true, now).is_some();
            if (opts.nx && exists) || (opts.xx && !exists) {
                reply.null();
                return Err(Rollback.into());
            }
        }
        txn.put(key, &codec::encode(value, opts.expire_at))?;
        txn.commit()?;
        reply.ok();
        Ok(())
    });
    if done.is_some() {
        ctx.state.host.add_dirty(1);
    }
}

/// MMDEL key [key ...]
pub fn del(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    let now = ctx.now_ms;
    let removed = ctx.state.store.write("mmdel", reply, |txn, reply| {
        let (mut live_deleted, mut removed) = (0u64, 0u64);
        for key in &argv[1..] {
            let was_live = live(txn.get(key)?, true, now).is_some();
            if txn.delete(key)? {
                removed += 1;
                live_deleted += u64::from(was_live);
            }
        }
        txn.commit()?;
        // Expired records were already gone as far as clients are concerned,
        // but their removal still changes the dataset replicas must mirror.
        reply.integer(live_deleted as i64);
        Ok(removed)
    });
    if let Some(removed) = removed {
        ctx.state.host.add_dirty(removed);
    }
}

/// MMINCRBY key increment
pub fn incrby(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    let Some(incr) = parse_i64(&argv[2]) else {
        reply.error(NOT_AN_INTEGER);
        return;
    };
    let now = ctx.now_ms;
    let key = &argv[1];

    let done = ctx.state.store.write("mmincrby", reply, |txn, reply| {
        let (current, expire_at) = match live(txn.get(key)?, false, now) {
            Some(value) => match parse_i64(value.bytes()) {
                Some(n) => (n, value.expire_at),
                None => {
                    reply.error(NOT_AN_INTEGER);
                    return Err(Rollback.into());
                }
            },
            None => (0, None),
        };

        let Some(updated) = current.checked_add(incr) else {
            reply.error("ERR increment or decrement would overflow");
            return Err(Rollback.into());
        };

        txn.put(key, &codec::encode(updated.to_string().as_bytes(), expire_at))?;
        txn.commit()?;
        reply.integer(updated);
        Ok(())
    });
    if done.is_some() {
        ctx.state.host.add_dirty(1);
    }
}

/// MMAPPEND key value
pub fn append(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    let now = ctx.now_ms;
    let (key, suffix) = (&argv[1], &argv[2]);

    let done = ctx.state.store.write("mmappend", reply, |txn, reply| {
        let (mut payload, expire_at) = match live(txn.get(key)?, false, now) {
            Some(value) => (value.bytes().to_vec(), value.expire_at),
            None => (Vec::with_capacity(suffix.len()), None),
        };
        payload.extend_from_slice(suffix);

        txn.put(key, &codec::encode(&payload, expire_at))?;
        txn.commit()?;
        reply.integer(payload.len() as i64);
        Ok(())
    });
    if done.is_some() {
        ctx.state.host.add_dirty(1);
    }
}

/// MMEXPIRE key seconds
pub fn expire(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    let now = ctx.now_ms;
    expire_generic(ctx, argv, reply, "mmexpire", now, 1000);
}

/// MMEXPIREAT key unix-seconds
pub fn expireat(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    expire_generic(ctx, argv, reply, "mmexpireat", 0, 1000);
}

/// MMPEXPIRE key milliseconds
pub fn pexpire(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    let now = ctx.now_ms;
    expire_generic(ctx, argv, reply, "mmpexpire", now, 1);
}

/// MMPEXPIREAT key unix-milliseconds
pub fn pexpireat(ctx: &mut Context<'_>, argv: &[Bytes], reply: &mut Reply) {
    expire_generic(ctx, argv, reply, "mmpexpireat", 0, 1);
}

/// Sets the absolute expiration `base_ms + argv[2] * unit_ms` on a live key.
fn expire_generic(
    ctx: &mut Context<'_>,
    argv: &[Bytes],
    reply: &mut Reply,
    cmd: &str,
    base_ms: i64,
    unit_ms: i64,
) {
    let Some(when) = parse_i64(&argv[2]) else {
        reply.error(NOT_AN_INTEGER);
        return;
    };
    let Some(expire_at) = when
        .checked_mul(unit_ms)
        .and_then(|ms| ms.checked_add(base_ms))
    else {
        reply.error(format!("ERR invalid expire time in '{}' command", cmd));
        return;
    };
    let now = ctx.now_ms;
    let key = &argv[1];

    let done = ctx.state.store.write(cmd, reply, |txn, reply| {
        let Some(value) = live(txn.get(key)?, false, now) else {
            reply.integer(0);
            return Err(Rollback.into());
        };
        txn.put(key, &codec::encode(value.bytes(), Some(expire_at)))?;
        txn.commit()?;
        reply.integer(1);
        Ok(())
    });
    if done.is_some() {
        ctx.state.host.add_dirty(1);
    }
}

/// MMFLUSHDB
pub fn flushdb(ctx: &mut Context<'_>, _argv: &[Bytes], reply: &mut Reply) {
    let dropped = ctx.state.store.write("mmflushdb", reply, |txn, reply| {
        let entries = txn.entries()?;
        txn.drop_all()?;
        txn.commit()?;
        reply.ok();
        Ok(entries)
    });
    if let Some(entries) = dropped {
        ctx.state.host.add_dirty(entries);
    }
}
