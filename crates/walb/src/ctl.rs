//! The control client: one short-lived connection per command.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use walb_proto::{connect, recv_msg, send_msg, Reply};

use crate::cli::{CtlArgs, CtlCommands};

async fn request<Req, Resp>(args: &CtlArgs, protocol: &str, req: &Req) -> Result<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let timeout = Duration::from_secs(args.timeout_secs);
    let mut stream = connect(args.addr, &args.client_id, protocol, timeout)
        .await
        .with_context(|| format!("cannot reach {}", args.addr))?;
    send_msg(&mut stream, req).await?;
    let reply: Reply<Resp> = recv_msg(&mut stream).await?;
    Ok(reply.into_result()?)
}

fn parse_uuid(s: &str) -> Result<[u8; 16]> {
    let bytes = (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
        .collect::<std::result::Result<Vec<u8>, _>>()
        .context("bad uuid hex")?;
    bytes.try_into().map_err(|_| anyhow::anyhow!("uuid must be 16 bytes"))
}

/// Execute one control command against a daemon.
pub async fn run(args: CtlArgs) -> Result<()> {
    match &args.command {
        CtlCommands::InitVol { vol_id, wdev_path } => match wdev_path {
            Some(path) => {
                let req = walb_storage::InitVolReq {
                    vol_id: vol_id.clone(),
                    wdev_path: path.clone(),
                };
                let () = request(&args, "init-vol", &req).await?;
            }
            None => {
                let req = walb_archive::InitVolReq { vol_id: vol_id.clone() };
                let () = request(&args, "init-vol", &req).await?;
            }
        },
        CtlCommands::ClearVol { vol_id } => {
            let req = walb_storage::VolReq { vol_id: vol_id.clone() };
            let () = request(&args, "clear-vol", &req).await?;
        }
        CtlCommands::ResetVol { vol_id, gid } => {
            let req = walb_storage::ResetVolReq { vol_id: vol_id.clone(), gid: *gid };
            let () = request(&args, "reset-vol", &req).await?;
        }
        CtlCommands::FullBkp { vol_id, size_lb, uuid } => match (size_lb, uuid) {
            (Some(size_lb), Some(uuid)) => {
                let req = walb_archive::FullBkpReq {
                    vol_id: vol_id.clone(),
                    size_lb: *size_lb,
                    uuid: parse_uuid(uuid)?,
                };
                let () = request(&args, "full-bkp", &req).await?;
            }
            (None, None) => {
                let req = walb_storage::VolReq { vol_id: vol_id.clone() };
                let () = request(&args, "full-bkp", &req).await?;
            }
            _ => bail!("--size-lb and --uuid go together (archive full-bkp)"),
        },
        CtlCommands::Start { vol_id, master } => {
            // The storage daemon wants the master flag; the other roles
            // take a bare volume id.
            if *master {
                let req = walb_storage::StartReq { vol_id: vol_id.clone(), master: true };
                let () = request(&args, "start", &req).await?;
            } else {
                let req = walb_proxy::VolReq { vol_id: vol_id.clone() };
                let () = request(&args, "start", &req).await?;
            }
        }
        CtlCommands::Stop { vol_id, wait_for_empty } => {
            let req = walb_proxy::StopReq {
                vol_id: vol_id.clone(),
                wait_for_empty: *wait_for_empty,
            };
            let () = request(&args, "stop", &req).await?;
        }
        CtlCommands::Snapshot { vol_id } => {
            let req = walb_storage::VolReq { vol_id: vol_id.clone() };
            let gid: u64 = request(&args, "snapshot", &req).await?;
            println!("{gid}");
        }
        CtlCommands::AddArchiveInfo { vol_id, archive, addr } => {
            let req = walb_proxy::ArchiveInfoReq {
                vol_id: vol_id.clone(),
                archive: archive.clone(),
                addr: Some(*addr),
            };
            let () = request(&args, "add-archive-info", &req).await?;
        }
        CtlCommands::DeleteArchiveInfo { vol_id, archive } => {
            let req = walb_proxy::ArchiveInfoReq {
                vol_id: vol_id.clone(),
                archive: archive.clone(),
                addr: None,
            };
            let () = request(&args, "delete-archive-info", &req).await?;
        }
        CtlCommands::Restore { vol_id, gid } => {
            let req = walb_archive::GidReq { vol_id: vol_id.clone(), gid: *gid };
            let () = request(&args, "restore", &req).await?;
        }
        CtlCommands::Apply { vol_id, gid } => {
            let req = walb_archive::GidReq { vol_id: vol_id.clone(), gid: *gid };
            let () = request(&args, "apply", &req).await?;
        }
        CtlCommands::Restorable { vol_id } => {
            let req = walb_archive::VolReq { vol_id: vol_id.clone() };
            let gids: Vec<u64> = request(&args, "restorable", &req).await?;
            for gid in gids {
                println!("{gid}");
            }
        }
        CtlCommands::GetState { vol_id } => {
            let req = walb_storage::VolReq { vol_id: vol_id.clone() };
            let state: String = request(&args, "get-state", &req).await?;
            println!("{state}");
        }
        CtlCommands::Status { vol_id } => {
            let req = walb_storage::VolReq { vol_id: vol_id.clone() };
            let lines: Vec<String> = request(&args, "status", &req).await?;
            for line in lines {
                println!("{line}");
            }
        }
    }
    Ok(())
}
