//! The `wdiff-send` protocol bodies.
//!
//! Client: send the request, wait for the accept, stream packs, wait for
//! the final ack. Server: after validating the request, receive the pack
//! stream into a temp file, verifying every pack and payload checksum.
//! The rename into place and the meta-manager update stay with the
//! caller, which also owns idempotence for retried transfers.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use walb_core::checksum::sum32;
use walb_core::{Error, Result, UUID_SIZE};
use walb_diff::{
    DiffFileHeader, DiffFormat, DiffPackHeader, DiffRecord, DIFF_PACK_SIZE,
};
use walb_meta::MetaDiff;

use crate::frame::{
    recv_bytes, recv_msg, recv_stream_control, send_bytes, send_msg, send_stream_control,
    Reply, StreamControl,
};

/// Protocol name for wdiff transfer.
pub const PROTO_WDIFF_SEND: &str = "wdiff-send";

/// The `wdiff-send` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WdiffSendReq {
    /// Target volume.
    pub vol_id: String,
    /// The transition this diff encodes.
    pub diff: MetaDiff,
    /// Device uuid stamped into the transferred file.
    pub uuid: [u8; UUID_SIZE],
}

/// Client body: stream the records produced by `next` (stored form,
/// checksums already valid) after the request is accepted.
pub async fn send_wdiff_stream<S, F>(
    stream: &mut S,
    req: &WdiffSendReq,
    mut next: F,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut() -> Result<Option<(DiffRecord, Vec<u8>)>>,
{
    send_msg(stream, req).await?;
    let accept: Reply<()> = recv_msg(stream).await?;
    accept.into_result()?;

    let mut pack = DiffPackHeader::new();
    let mut payloads: Vec<Vec<u8>> = Vec::new();
    loop {
        let entry = match next() {
            Ok(e) => e,
            Err(e) => {
                let _ = send_stream_control(stream, StreamControl::Error).await;
                return Err(e);
            }
        };
        let Some((rec, data)) = entry else { break };
        if !pack.add(rec) {
            flush_pack(stream, &mut pack, &mut payloads).await?;
            if !pack.add(rec) {
                return Err(Error::internal("record does not fit an empty pack".to_string()));
            }
        }
        payloads.push(data);
    }
    flush_pack(stream, &mut pack, &mut payloads).await?;
    send_stream_control(stream, StreamControl::End).await?;

    let done: Reply<()> = recv_msg(stream).await?;
    done.into_result()
}

async fn flush_pack<S: AsyncWrite + Unpin>(
    stream: &mut S,
    pack: &mut DiffPackHeader,
    payloads: &mut Vec<Vec<u8>>,
) -> Result<()> {
    if pack.is_empty() {
        return Ok(());
    }
    send_stream_control(stream, StreamControl::Next).await?;
    send_bytes(stream, &pack.encode()).await?;
    for data in payloads.drain(..) {
        send_bytes(stream, &data).await?;
    }
    pack.clear();
    Ok(())
}

/// Server body: receive the pack stream into `tmp_path` as a complete
/// sorted wdiff.
///
/// The caller has already read the request, validated the volume state,
/// and replied with the accept. The caller sends the final ack with
/// [`ack_wdiff_stream`] once the file is renamed into place and
/// registered, so a client never sees success for a diff the server then
/// lost.
pub async fn recv_wdiff_stream<S>(
    stream: &mut S,
    tmp_path: &Path,
    uuid: [u8; UUID_SIZE],
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut file = tokio::fs::File::create(tmp_path).await?;
    file.write_all(&DiffFileHeader::new(DiffFormat::Sorted, uuid).encode()).await?;

    loop {
        match recv_stream_control(stream).await? {
            StreamControl::Next => {}
            StreamControl::End => break,
            StreamControl::Error => {
                return Err(Error::ProtocolMismatch("sender aborted the stream".to_string()));
            }
        }
        let pack_bytes = recv_bytes(stream, DIFF_PACK_SIZE).await?;
        let pack = DiffPackHeader::decode(&pack_bytes)?;
        if pack.is_end() {
            return Err(Error::ProtocolMismatch(
                "END pack inside a controlled stream".to_string(),
            ));
        }
        file.write_all(&pack_bytes).await?;
        for rec in pack.records() {
            let data = recv_bytes(stream, rec.data_size as usize).await?;
            if !data.is_empty() {
                let csum = sum32(&data, 0);
                if csum != rec.checksum {
                    return Err(Error::invalid_format(format!(
                        "transferred payload checksum mismatch: {csum:08x} != {:08x}",
                        rec.checksum
                    )));
                }
            }
            file.write_all(&data).await?;
        }
    }
    file.write_all(&DiffPackHeader::end().encode()).await?;
    file.sync_data().await?;
    Ok(())
}

/// Send the final ack (or rejection) of a wdiff transfer.
pub async fn ack_wdiff_stream<S>(stream: &mut S, result: &Result<()>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reply: Reply<()> = match result {
        Ok(()) => Reply::Ok(()),
        Err(e) => Reply::from_error(e),
    };
    send_msg(stream, &reply).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use walb_core::LOGICAL_BLOCK_SIZE;
    use walb_diff::SortedDiffReader;
    use walb_meta::MetaDiff as MD;

    fn sample_records(n: u64) -> Vec<(DiffRecord, Vec<u8>)> {
        (0..n)
            .map(|i| {
                let data = vec![i as u8; 2 * LOGICAL_BLOCK_SIZE];
                let mut rec = DiffRecord::normal(i * 4, 2);
                rec.update_checksum(&data);
                (rec, data)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let tmp = dir.path().join("recv.wdiff.tmp");
        let (mut client, mut server) = tokio::io::duplex(16 * 1024);

        let req = WdiffSendReq {
            vol_id: "vol0".to_string(),
            diff: MD::clean(0, 1, 12345),
            uuid: [6; 16],
        };
        let records = sample_records(5);

        let server_tmp = tmp.clone();
        let server_task = tokio::spawn(async move {
            let got: WdiffSendReq = recv_msg(&mut server).await.unwrap();
            assert_eq!(got.vol_id, "vol0");
            send_msg(&mut server, &Reply::Ok(())).await.unwrap();
            let result = recv_wdiff_stream(&mut server, &server_tmp, got.uuid).await;
            ack_wdiff_stream(&mut server, &result).await.unwrap();
            result
        });

        let mut iter = records.clone().into_iter();
        send_wdiff_stream(&mut client, &req, move || Ok(iter.next()))
            .await
            .unwrap();
        server_task.await.unwrap().unwrap();

        // The received temp file is a complete, valid sorted wdiff.
        let buf = std::fs::read(&tmp).unwrap();
        let mut reader = SortedDiffReader::new(buf.as_slice());
        let header = reader.read_header().unwrap();
        assert_eq!(header.uuid, [6; 16]);
        let mut got = Vec::new();
        while let Some((rec, data)) = reader.read_diff().unwrap() {
            got.push((rec, data));
        }
        assert_eq!(got.len(), records.len());
        for ((grec, gdata), (rec, data)) in got.iter().zip(&records) {
            assert_eq!(grec.io_address, rec.io_address);
            assert_eq!(gdata, data);
        }
    }

    #[tokio::test]
    async fn test_reject_short_circuits() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let req = WdiffSendReq {
            vol_id: "vol0".to_string(),
            diff: MD::clean(0, 1, 0),
            uuid: [0; 16],
        };
        let server_task = tokio::spawn(async move {
            let _got: WdiffSendReq = recv_msg(&mut server).await.unwrap();
            let reply: Reply<()> =
                Reply::from_error(&Error::bad_state("Stopped".to_string()));
            send_msg(&mut server, &reply).await.unwrap();
        });
        let err = send_wdiff_stream(&mut client, &req, || {
            panic!("stream must not start after a reject")
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::BadState(_)));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_payload_detected_by_server() {
        let dir = tempfile::TempDir::new().unwrap();
        let tmp = dir.path().join("recv.wdiff.tmp");
        let (mut client, mut server) = tokio::io::duplex(16 * 1024);

        let server_task = tokio::spawn(async move {
            recv_wdiff_stream(&mut server, &tmp, [0; 16]).await
        });

        // Hand-craft a pack whose payload does not match its checksum.
        let data = vec![0xaa; LOGICAL_BLOCK_SIZE];
        let mut rec = DiffRecord::normal(0, 1);
        rec.update_checksum(&data);
        let mut pack = DiffPackHeader::new();
        pack.add(rec);
        send_stream_control(&mut client, StreamControl::Next).await.unwrap();
        send_bytes(&mut client, &pack.encode()).await.unwrap();
        let mut bad = data.clone();
        bad[0] ^= 1;
        send_bytes(&mut client, &bad).await.unwrap();

        let err = server_task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)));
    }
}
