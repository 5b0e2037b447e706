//! Persistent reservation coordinator
//!
//! Fans a persistent-reservation request out across a map's usable paths.
//! The SCSI/NVMe command transport is a collaborator behind
//! [`PrTransport`]; the coordinator owns target resolution (kernel dm-uuid
//! → map), path selection (Up/Ghost only), result aggregation, and keeping
//! the prkeys file in sync for register-style service actions.

use log::{debug, info, warn};

use crate::dm::DmChannel;
use crate::error::{CoreError, CoreResult};
use crate::prkeys::{PrKey, PrKeysFile};
use crate::structs::{Multipath, PathRef, Vecs};

/// Persistent reservation IN service actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrInAction {
    ReadKeys,
    ReadReservation,
    ReportCapabilities,
    ReadFullStatus,
}

/// Persistent reservation OUT service actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrOutAction {
    Register,
    RegisterIgnore,
    Reserve,
    Release,
    Clear,
    Preempt,
    PreemptAndAbort,
}

/// Parameter block of an OUT request.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrOutParams {
    pub key: u64,
    pub sa_key: u64,
    pub prtype: u8,
    pub aptpl: bool,
}

/// Reply to an IN request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrInResponse {
    pub generation: u32,
    pub keys: Vec<u64>,
    /// (holder key, reservation type) when a reservation exists
    pub reservation: Option<(u64, u8)>,
}

/// The persistent-reservation command transport for one path device.
pub trait PrTransport: Send + Sync {
    fn send_in(&self, dev: &str, action: PrInAction) -> CoreResult<PrInResponse>;
    fn send_out(&self, dev: &str, action: PrOutAction, params: &PrOutParams) -> CoreResult<()>;
}

/// Coordinates reservation traffic for maps.
pub struct PrCoordinator<'a> {
    pub dm: &'a dyn DmChannel,
    pub transport: &'a dyn PrTransport,
    pub prkeys: &'a PrKeysFile,
    /// Registrations reach all target ports through one path
    pub all_tg_pt: bool,
}

impl<'a> PrCoordinator<'a> {
    /// Resolve the map a kernel dm-uuid refers to.
    fn resolve_map<'v>(&self, vecs: &'v Vecs, dm_uuid: &str) -> CoreResult<&'v Multipath> {
        let name = self
            .dm
            .find_map_by_uuid(dm_uuid)
            .ok_or_else(|| CoreError::NotFound {
                object: format!("map with uuid {}", dm_uuid),
            })?;
        let idx = vecs
            .find_map_by_alias(&name)
            .ok_or_else(|| CoreError::NotFound {
                object: format!("map {}", name),
            })?;
        Ok(&vecs.maps[idx])
    }

    /// Paths currently able to carry commands.
    fn usable_paths(mp: &Multipath) -> Vec<PathRef> {
        mp.paths
            .iter()
            .filter(|pp| pp.read().state.is_active())
            .cloned()
            .collect()
    }

    /// Issue an IN request through any single usable path.
    pub fn reserve_in(
        &self,
        vecs: &Vecs,
        dm_uuid: &str,
        action: PrInAction,
    ) -> CoreResult<PrInResponse> {
        let mp = self.resolve_map(vecs, dm_uuid)?;
        let paths = Self::usable_paths(mp);
        let mut last_err = CoreError::NotFound {
            object: format!("usable paths of {}", mp.alias),
        };
        for pp in &paths {
            let dev = pp.read().dev.clone();
            match self.transport.send_in(&dev, action) {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    info!("{}: reservation-in through {} failed: {}", mp.alias, dev, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Fan an OUT request over the map's usable paths. Registration-style
    /// actions go through a single path when `all_tg_pt` is set, otherwise
    /// every path is driven; the request succeeds when any path succeeded.
    /// Register/register-and-ignore update the prkeys file so the key is
    /// reapplied after restart; clear removes it.
    pub fn reserve_out(
        &self,
        vecs: &Vecs,
        dm_uuid: &str,
        action: PrOutAction,
        params: &PrOutParams,
    ) -> CoreResult<()> {
        let mp = self.resolve_map(vecs, dm_uuid)?;
        let paths = Self::usable_paths(mp);
        if paths.is_empty() {
            return Err(CoreError::NotFound {
                object: format!("usable paths of {}", mp.alias),
            });
        }

        let single_path = self.all_tg_pt
            && matches!(action, PrOutAction::Register | PrOutAction::RegisterIgnore);
        let targets: &[PathRef] = if single_path { &paths[..1] } else { &paths };

        let mut successes = 0;
        let mut last_err: Option<CoreError> = None;
        for pp in targets {
            let dev = pp.read().dev.clone();
            match self.transport.send_out(&dev, action, params) {
                Ok(()) => {
                    debug!("{}: reservation-out through {} ok", mp.alias, dev);
                    successes += 1;
                }
                Err(e) => {
                    warn!("{}: reservation-out through {} failed: {}", mp.alias, dev, e);
                    last_err = Some(e);
                }
            }
        }
        if successes == 0 {
            return Err(last_err.unwrap_or(CoreError::Transient {
                operation: "persistent reservation out".to_string(),
                reason: "no path accepted the request".to_string(),
            }));
        }

        match action {
            PrOutAction::Register | PrOutAction::RegisterIgnore => {
                if params.sa_key != 0 {
                    self.prkeys.set_prkey(
                        &mp.wwid,
                        PrKey {
                            key: params.sa_key,
                            aptpl: params.aptpl,
                        },
                    )?;
                } else {
                    self.prkeys.remove_prkey(&mp.wwid)?;
                }
            }
            PrOutAction::Clear => {
                self.prkeys.remove_prkey(&mp.wwid)?;
            }
            _ => {}
        }
        Ok(())
    }
}
