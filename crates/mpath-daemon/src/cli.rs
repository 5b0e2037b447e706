//! Control socket command dispatch
//!
//! Tokenises the raw command line, matches the longest keyword prefix in
//! the handler table, and maps handler results onto the wire replies:
//! `ok`, `fail`, `timeout`, or a multi-line body. Handlers declare whether
//! they need the global vectors lock; acquisition is bounded by the
//! configured uxsock_timeout. Non-root peers may only run `list`/`show`.

use std::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{info, warn};

use mpath_core::alias::BindingsFile;
use mpath_core::dm::DmPathState;
use mpath_core::error::{CoreError, CoreResult};
use mpath_core::mapstate::{
    add_map_with_path, orphan_path, remove_map, set_no_path_retry, update_queue_mode_del_path,
};
use mpath_core::structs::{find_slot, Path, Vecs};

use crate::daemon::{reconfigure, regroup_map, DaemonCtx};

pub const PERMISSION_DENY: &str = "permission deny: need to be root";

/// What the listener should do with the client after sending the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAction {
    None,
    CloseClient,
    ShutdownDaemon,
}

/// A finished command: the reply text plus the follow-up action.
pub struct Reply {
    pub text: String,
    pub action: ClientAction,
}

impl Reply {
    fn ok() -> Self {
        Reply {
            text: "ok\n".to_string(),
            action: ClientAction::None,
        }
    }

    fn fail() -> Self {
        Reply {
            text: "fail\n".to_string(),
            action: ClientAction::None,
        }
    }

    fn body(text: String) -> Self {
        let text = if text.ends_with('\n') {
            text
        } else {
            text + "\n"
        };
        Reply {
            text,
            action: ClientAction::None,
        }
    }
}

type HandlerFn = fn(&DaemonCtx, Option<&mut Vecs>, &[&str]) -> CoreResult<Option<String>>;

struct Handler {
    keywords: &'static [&'static str],
    locked: bool,
    run: HandlerFn,
}

const HANDLERS: &[Handler] = &[
    Handler { keywords: &["list", "paths"], locked: true, run: cli_list_paths },
    Handler { keywords: &["list", "maps"], locked: true, run: cli_list_maps },
    Handler { keywords: &["show", "config"], locked: false, run: cli_show_config },
    Handler { keywords: &["show", "map"], locked: true, run: cli_show_map },
    Handler { keywords: &["show", "path"], locked: true, run: cli_show_path },
    Handler { keywords: &["add", "path"], locked: true, run: cli_add_path },
    Handler { keywords: &["remove", "path"], locked: true, run: cli_del_path },
    Handler { keywords: &["del", "path"], locked: true, run: cli_del_path },
    Handler { keywords: &["add", "map"], locked: true, run: cli_add_map },
    Handler { keywords: &["remove", "map"], locked: true, run: cli_del_map },
    Handler { keywords: &["del", "map"], locked: true, run: cli_del_map },
    Handler { keywords: &["resize", "map"], locked: true, run: cli_resize_map },
    Handler { keywords: &["reset", "maps", "stats"], locked: true, run: cli_reset_stats },
    Handler { keywords: &["reconfigure"], locked: false, run: cli_reconfigure },
    Handler { keywords: &["forcequeueing", "daemon"], locked: true, run: cli_force_queueing },
    Handler { keywords: &["restorequeueing", "daemon"], locked: true, run: cli_restore_queueing },
];

fn genhelp() -> String {
    let mut out = String::from("commands:\n");
    for h in HANDLERS {
        let _ = writeln!(out, "\t{}", h.keywords.join(" "));
    }
    out.push_str("\tquit\n\tshutdown\n");
    out
}

/// Handle one command line from a client.
pub fn uxsock_trigger(ctx: &DaemonCtx, line: &str, is_root: bool) -> Reply {
    let line = line.trim();
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.is_empty() {
        return Reply::body(genhelp());
    }

    // closing your own connection needs no privilege
    if tokens[0] == "quit" || tokens[0] == "exit" {
        return Reply {
            text: "ok\n".to_string(),
            action: ClientAction::CloseClient,
        };
    }

    if !is_root && tokens[0] != "list" && tokens[0] != "show" {
        return Reply {
            text: format!("{}\n", PERMISSION_DENY),
            action: ClientAction::None,
        };
    }

    if tokens[0] == "shutdown" {
        info!("shutdown command received");
        ctx.request_shutdown();
        return Reply {
            text: "ok\n".to_string(),
            action: ClientAction::ShutdownDaemon,
        };
    }

    // longest matching keyword prefix wins
    let mut best: Option<&Handler> = None;
    for h in HANDLERS {
        if h.keywords.len() <= tokens.len()
            && h.keywords.iter().zip(tokens.iter()).all(|(k, t)| k == t)
            && best.map(|b| b.keywords.len() < h.keywords.len()).unwrap_or(true)
        {
            best = Some(h);
        }
    }
    let handler = match best {
        Some(h) => h,
        None => return Reply::body(genhelp()),
    };
    let args = &tokens[handler.keywords.len()..];

    let result = if handler.locked {
        let timeout = Duration::from_millis(ctx.conf.read().uxsock_timeout as u64);
        match ctx.vecs.try_write_for(timeout) {
            Some(mut vecs) => (handler.run)(ctx, Some(&mut *vecs), args),
            None => {
                warn!("command \"{}\" timed out waiting for the vecs lock", line);
                return Reply {
                    text: "timeout\n".to_string(),
                    action: ClientAction::None,
                };
            }
        }
    } else {
        (handler.run)(ctx, None, args)
    };

    match result {
        Ok(None) => Reply::ok(),
        Ok(Some(body)) => Reply::body(body),
        Err(e) => {
            warn!("command \"{}\" failed: {}", line, e);
            Reply::fail()
        }
    }
}

fn need_vecs<'a>(vecs: Option<&'a mut Vecs>) -> &'a mut Vecs {
    vecs.expect("locked handler dispatched without the vecs lock")
}

fn one_arg<'a>(args: &[&'a str], what: &str) -> CoreResult<&'a str> {
    match args {
        &[arg] => Ok(arg),
        _ => Err(CoreError::Config {
            option: what.to_string(),
            value: args.join(" "),
            reason: "expected exactly one argument".to_string(),
        }),
    }
}

fn dmstate_name(state: DmPathState) -> &'static str {
    match state {
        DmPathState::Undef => "undef",
        DmPathState::Active => "active",
        DmPathState::Failed => "failed",
    }
}

fn cli_list_paths(
    _ctx: &DaemonCtx,
    vecs: Option<&mut Vecs>,
    _args: &[&str],
) -> CoreResult<Option<String>> {
    let vecs = need_vecs(vecs);
    let mut out = String::from("dev        dev_t      pri  dm_st   chk_st     map\n");
    for pp in &vecs.paths {
        let pp = pp.read();
        let _ = writeln!(
            out,
            "{:<10} {:<10} {:<4} {:<7} {:<10} {}",
            pp.dev,
            pp.dev_t,
            pp.priority,
            dmstate_name(pp.dmstate),
            pp.state.name(),
            pp.mpp.as_deref().unwrap_or("[orphan]"),
        );
    }
    Ok(Some(out))
}

fn cli_list_maps(
    _ctx: &DaemonCtx,
    vecs: Option<&mut Vecs>,
    _args: &[&str],
) -> CoreResult<Option<String>> {
    let vecs = need_vecs(vecs);
    let mut out = String::from("name       wwid                 paths policy             recovery\n");
    for mp in &vecs.maps {
        let _ = writeln!(
            out,
            "{:<10} {:<20} {:<5} {:<18} {}",
            mp.alias,
            mp.wwid,
            mp.paths.len(),
            mp.pgpolicy.name(),
            if mp.in_recovery { "yes" } else { "no" },
        );
    }
    Ok(Some(out))
}

fn cli_show_config(
    ctx: &DaemonCtx,
    _vecs: Option<&mut Vecs>,
    _args: &[&str],
) -> CoreResult<Option<String>> {
    Ok(Some(ctx.conf.read().snprint()))
}

fn cli_show_map(
    _ctx: &DaemonCtx,
    vecs: Option<&mut Vecs>,
    args: &[&str],
) -> CoreResult<Option<String>> {
    let vecs = need_vecs(vecs);
    let name = one_arg(args, "show map")?;
    let idx = vecs
        .find_map_by_alias(name)
        .or_else(|| vecs.find_map_by_wwid(name))
        .ok_or_else(|| CoreError::NotFound {
            object: format!("map {}", name),
        })?;
    let mp = &vecs.maps[idx];
    let mut out = String::new();
    let _ = writeln!(out, "name: {}", mp.alias);
    let _ = writeln!(out, "wwid: {}", mp.wwid);
    let _ = writeln!(out, "size: {}", mp.size);
    let _ = writeln!(out, "features: {}", mp.features);
    let _ = writeln!(out, "hwhandler: {}", mp.hwhandler);
    let _ = writeln!(out, "policy: {}", mp.pgpolicy.name());
    let _ = writeln!(out, "no_path_retry: {:?}", mp.no_path_retry);
    let _ = writeln!(out, "in_recovery: {}", mp.in_recovery);
    let _ = writeln!(out, "retry_tick: {}", mp.retry_tick);
    let _ = writeln!(
        out,
        "stats: queueing_timeouts={} map_failures={} switchgroup={}",
        mp.stat_queueing_timeouts, mp.stat_map_failures, mp.stat_switchgroup
    );
    for (i, pg) in mp.groups.iter().enumerate() {
        let devs: Vec<String> = pg.paths.iter().map(|pp| pp.read().dev.clone()).collect();
        let _ = writeln!(
            out,
            "group {}: prio={} enabled={} marginal={} paths=[{}]",
            i,
            pg.priority,
            pg.enabled_paths,
            pg.marginal,
            devs.join(" "),
        );
    }
    Ok(Some(out))
}

fn cli_show_path(
    _ctx: &DaemonCtx,
    vecs: Option<&mut Vecs>,
    args: &[&str],
) -> CoreResult<Option<String>> {
    let vecs = need_vecs(vecs);
    let dev = one_arg(args, "show path")?;
    let pp = vecs.find_path_by_dev(dev).ok_or_else(|| CoreError::NotFound {
        object: format!("path {}", dev),
    })?;
    let pp = pp.read();
    let mut out = String::new();
    let _ = writeln!(out, "dev: {}", pp.dev);
    let _ = writeln!(out, "dev_t: {}", pp.dev_t);
    let _ = writeln!(out, "wwid: {}", pp.wwid);
    let _ = writeln!(out, "state: {}", pp.state.name());
    let _ = writeln!(out, "dm state: {}", dmstate_name(pp.dmstate));
    let _ = writeln!(out, "priority: {}", pp.priority);
    let _ = writeln!(out, "marginal: {}", pp.marginal);
    let _ = writeln!(out, "checker: {}{}", pp.checker.name(), pp.checker.message());
    let _ = writeln!(out, "map: {}", pp.mpp.as_deref().unwrap_or("[orphan]"));
    Ok(Some(out))
}

fn cli_add_path(
    ctx: &DaemonCtx,
    vecs: Option<&mut Vecs>,
    args: &[&str],
) -> CoreResult<Option<String>> {
    let vecs = need_vecs(vecs);
    let dev = one_arg(args, "add path")?;
    let conf = ctx.conf.read();

    if conf.filter_devnode(dev) {
        return Err(CoreError::PolicyViolation {
            object: dev.to_string(),
            reason: "device node is blacklisted".to_string(),
        });
    }
    if vecs.find_path_by_dev(dev).is_some() {
        return Ok(None);
    }
    let seed = ctx.sysfs.seed(dev).ok_or_else(|| CoreError::DeviceGone {
        dev: dev.to_string(),
    })?;
    if conf.filter_wwid(&seed.wwid) {
        return Err(CoreError::PolicyViolation {
            object: dev.to_string(),
            reason: format!("wwid {} is blacklisted", seed.wwid),
        });
    }

    let mut pp = Path::new(&seed.dev, &seed.dev_t);
    pp.wwid = seed.wwid.clone();
    pp.vendor_id = seed.vendor_id;
    pp.product_id = seed.product_id;
    pp.rev = seed.rev;
    pp.serial = seed.serial;
    pp.tgt_node_name = seed.tgt_node_name;
    pp.size = seed.size;
    let pp_ref = std::sync::Arc::new(parking_lot::RwLock::new(pp));
    vecs.paths.push(pp_ref.clone());

    let checkint = conf.checkint();
    match vecs.find_map_by_wwid(&seed.wwid) {
        Some(idx) => {
            let Vecs { maps, paths } = vecs;
            let mp = &mut maps[idx];
            mpath_core::mapstate::adopt_paths(paths, mp, &conf, &ctx.checkers, &ctx.prios);
            regroup_map(mp, paths, &conf, ctx.dm.as_ref())?;
            set_no_path_retry(mp, ctx.dm.as_ref(), checkint, false);
        }
        None => {
            let bindings = BindingsFile::new(&conf.bindings_file);
            let idx = add_map_with_path(
                vecs,
                &pp_ref,
                true,
                &conf,
                &bindings,
                ctx.dm.as_ref(),
                &ctx.checkers,
                &ctx.prios,
            )?;
            if let Some(idx) = idx {
                let Vecs { maps, paths } = vecs;
                let mp = &mut maps[idx];
                regroup_map(mp, paths, &conf, ctx.dm.as_ref())?;
                set_no_path_retry(mp, ctx.dm.as_ref(), checkint, false);
            }
        }
    }
    Ok(None)
}

fn cli_del_path(
    ctx: &DaemonCtx,
    vecs: Option<&mut Vecs>,
    args: &[&str],
) -> CoreResult<Option<String>> {
    let vecs = need_vecs(vecs);
    let dev = one_arg(args, "remove path")?;
    let pp_ref = vecs.find_path_by_dev(dev).ok_or_else(|| CoreError::NotFound {
        object: format!("path {}", dev),
    })?;
    let conf = ctx.conf.read();
    let checkint = conf.checkint();

    let owner = pp_ref.read().mpp.clone();
    if let Some(alias) = owner {
        if let Some(idx) = vecs.find_map_by_alias(&alias) {
            let Vecs { maps, paths } = vecs;
            let mp = &mut maps[idx];
            for pg in &mut mp.groups {
                if let Some(j) = find_slot(&pg.paths, &pp_ref) {
                    pg.paths.remove(j);
                }
            }
            mp.groups.retain(|pg| !pg.paths.is_empty());
            if let Some(j) = find_slot(&mp.paths, &pp_ref) {
                mp.paths.remove(j);
            }
            update_queue_mode_del_path(mp, checkint);
            if let Err(e) = regroup_map(mp, paths, &conf, ctx.dm.as_ref()) {
                warn!("{}: reload after path removal failed: {}", alias, e);
            }
        }
    }
    orphan_path(&pp_ref, "path removed");
    if let Some(j) = find_slot(&vecs.paths, &pp_ref) {
        vecs.paths.remove(j);
    }
    Ok(None)
}

fn cli_add_map(
    ctx: &DaemonCtx,
    vecs: Option<&mut Vecs>,
    args: &[&str],
) -> CoreResult<Option<String>> {
    let vecs = need_vecs(vecs);
    let name = one_arg(args, "add map")?;
    if !mpath_core::alias::valid_alias(name) {
        return Err(CoreError::PolicyViolation {
            object: name.to_string(),
            reason: "invalid map name".to_string(),
        });
    }
    if vecs.find_map_by_alias(name).is_some() || vecs.find_map_by_wwid(name).is_some() {
        return Ok(None);
    }
    let conf = ctx.conf.read();
    // an orphan path carrying this WWID seeds the map
    let pp_ref = vecs
        .paths
        .iter()
        .find(|pp| {
            let pp = pp.read();
            pp.wwid == name && pp.mpp.is_none()
        })
        .cloned()
        .ok_or_else(|| CoreError::NotFound {
            object: format!("paths for map {}", name),
        })?;
    let bindings = BindingsFile::new(&conf.bindings_file);
    let idx = add_map_with_path(
        vecs,
        &pp_ref,
        true,
        &conf,
        &bindings,
        ctx.dm.as_ref(),
        &ctx.checkers,
        &ctx.prios,
    )?;
    if let Some(idx) = idx {
        let checkint = conf.checkint();
        let Vecs { maps, paths } = vecs;
        let mp = &mut maps[idx];
        regroup_map(mp, paths, &conf, ctx.dm.as_ref())?;
        set_no_path_retry(mp, ctx.dm.as_ref(), checkint, false);
    }
    Ok(None)
}

fn cli_del_map(
    ctx: &DaemonCtx,
    vecs: Option<&mut Vecs>,
    args: &[&str],
) -> CoreResult<Option<String>> {
    let vecs = need_vecs(vecs);
    let name = one_arg(args, "remove map")?;
    let idx = vecs
        .find_map_by_alias(name)
        .or_else(|| vecs.find_map_by_wwid(name))
        .ok_or_else(|| CoreError::NotFound {
            object: format!("map {}", name),
        })?;
    let alias = vecs.maps[idx].alias.clone();
    info!("{}: removing map by request", alias);
    if let Err(e) = ctx.dm.remove_map(&alias) {
        warn!("{}: kernel map removal failed: {}", alias, e);
    }
    remove_map(vecs, &alias, true);
    Ok(None)
}

fn cli_resize_map(
    ctx: &DaemonCtx,
    vecs: Option<&mut Vecs>,
    args: &[&str],
) -> CoreResult<Option<String>> {
    let vecs = need_vecs(vecs);
    let name = one_arg(args, "resize map")?;
    let idx = vecs
        .find_map_by_alias(name)
        .or_else(|| vecs.find_map_by_wwid(name))
        .ok_or_else(|| CoreError::NotFound {
            object: format!("map {}", name),
        })?;
    let mp = &mut vecs.maps[idx];
    let size = mp
        .paths
        .first()
        .map(|pp| pp.read().size)
        .unwrap_or(0);
    if size == 0 {
        return Err(CoreError::PolicyViolation {
            object: mp.alias.clone(),
            reason: "cannot resize a map without sized paths".to_string(),
        });
    }
    ctx.dm.resize_map(&mp.alias, size)?;
    mp.size = size;
    info!("{}: resized to {} sectors", mp.alias, size);
    Ok(None)
}

fn cli_reset_stats(
    _ctx: &DaemonCtx,
    vecs: Option<&mut Vecs>,
    _args: &[&str],
) -> CoreResult<Option<String>> {
    let vecs = need_vecs(vecs);
    for mp in &mut vecs.maps {
        mp.reset_stats();
    }
    Ok(None)
}

fn cli_reconfigure(
    ctx: &DaemonCtx,
    _vecs: Option<&mut Vecs>,
    _args: &[&str],
) -> CoreResult<Option<String>> {
    reconfigure(ctx)?;
    Ok(None)
}

fn cli_force_queueing(
    ctx: &DaemonCtx,
    vecs: Option<&mut Vecs>,
    _args: &[&str],
) -> CoreResult<Option<String>> {
    let vecs = need_vecs(vecs);
    ctx.force_queueing.store(true, Ordering::Release);
    for mp in &vecs.maps {
        if let Err(e) = ctx.dm.queue_if_no_path(&mp.alias, true) {
            warn!("{}: cannot force queueing: {}", mp.alias, e);
        }
    }
    info!("queueing forced on for all maps");
    Ok(None)
}

fn cli_restore_queueing(
    ctx: &DaemonCtx,
    vecs: Option<&mut Vecs>,
    _args: &[&str],
) -> CoreResult<Option<String>> {
    let vecs = need_vecs(vecs);
    ctx.force_queueing.store(false, Ordering::Release);
    let checkint = ctx.conf.read().checkint();
    for mp in &mut vecs.maps {
        set_no_path_retry(mp, ctx.dm.as_ref(), checkint, false);
    }
    info!("queueing policy restored for all maps");
    Ok(None)
}
