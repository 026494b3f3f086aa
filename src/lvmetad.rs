// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Communicating with `lvmetad`, the metadata daemon that caches VG
//! metadata across commands so a rescan of every PV's label isn't needed
//! before each one. This module only speaks the daemon's request/response
//! protocol; folding what it returns into a [`crate::registry::Cache`] is
//! [`crate::registry::Cache::seed_from_metadata_daemon`]'s job.

use std::io::{Read, Write};

use unix_socket::UnixStream;

use crate::parser::{buf_to_textmap, textmap_to_buf, LvmTextMap, TextMapOps};
use crate::vg::VG;
use crate::{Error, Result};

const LVMETAD_PATH: &str = "/run/lvm/lvmetad.socket";

fn collect_response(stream: &mut UnixStream) -> Result<Vec<u8>> {
    let mut buf = [0; 32];
    let mut v = Vec::new();

    loop {
        let bytes_read = stream.read(&mut buf)?;
        v.extend(&buf[..bytes_read]);

        if v.ends_with(b"\n##\n") {
            let len = v.len() - 4;
            v.truncate(len);
            return Ok(v);
        }
    }
}

fn send_request(
    req: &[u8],
    token: Option<&[u8]>,
    stream: &mut UnixStream,
    args: &Option<Vec<&[u8]>>,
) -> Result<Vec<u8>> {
    let mut v = Vec::new();
    v.extend(b"request = \"");
    v.extend(req);
    v.extend(b"\"\n");

    if let Some(token) = token {
        v.extend(b"token = \"filter:");
        v.extend(token);
        v.extend(b"\"\n");
    }

    if let Some(args) = args {
        for arg in args {
            v.extend(*arg);
            v.extend(b"\n");
        }
    }

    stream.write_all(&v)?;
    stream.write_all(b"\n##\n")?;

    collect_response(stream)
}

fn parse_error(context: &str) -> Error {
    Error::Parse(format!("lvmetad response parsing error: {}", context))
}

/// Make a request to the running `lvmetad` daemon and return its response,
/// with the `response = "OK"` / `response = "token_mismatch"` protocol
/// envelope already handled.
pub fn request(req: &[u8], args: Option<Vec<&[u8]>>) -> Result<LvmTextMap> {
    let token = b"0";

    let mut stream = UnixStream::connect(LVMETAD_PATH)?;

    let txt = send_request(req, Some(token), &mut stream, &args)?;
    let mut response = buf_to_textmap(&txt)?;

    if response
        .string_from_textmap("response")
        .ok_or_else(|| parse_error("missing response field"))?
        == "token_mismatch"
    {
        send_request(b"token_update", Some(token), &mut stream, &None)?;
        let retry = send_request(req, Some(token), &mut stream, &args)?;
        response = buf_to_textmap(&retry)?;
    }

    if response.get("global_invalid").is_some() || response.get("vg_invalid").is_some() {
        return Err(Error::NotFound("cached metadata flagged as invalid".to_string()));
    }

    if response
        .string_from_textmap("response")
        .ok_or_else(|| parse_error("missing response field"))?
        != "OK"
    {
        let reason = response
            .string_from_textmap("reason")
            .unwrap_or("no reason given");
        return Err(Error::NotFound(reason.to_string()));
    }

    response.remove("response");
    Ok(response)
}

/// Query `lvmetad` for the list of Volume Groups it currently knows about.
/// Each VG's full metadata is fetched with a follow-up `vg_lookup` request.
pub fn vg_list() -> Result<Vec<VG>> {
    let mut v = Vec::new();

    let list = request(b"vg_list", None)?;
    let vgs = list
        .textmap_from_textmap("volume_groups")
        .ok_or_else(|| parse_error("missing volume_groups"))?;

    for id in vgs.keys() {
        let name = vgs
            .textmap_from_textmap(id)
            .and_then(|val| val.string_from_textmap("name"))
            .ok_or_else(|| parse_error("missing vg name"))?;

        let mut option: Vec<u8> = Vec::new();
        option.extend(b"uuid = \"");
        option.extend(id.as_bytes());
        option.extend(b"\"");
        let options = vec![&option[..]];

        let vg_info = request(b"vg_lookup", Some(options))?;
        let md = vg_info
            .textmap_from_textmap("metadata")
            .ok_or_else(|| parse_error("missing metadata"))?;

        v.push(VG::from_textmap(name, md)?);
    }

    Ok(v)
}

/// Tell `lvmetad` about the current state of a single Volume Group, keyed
/// by name, as produced by [`crate::vg::to_textmap`].
pub fn vg_update(map: &LvmTextMap) -> Result<()> {
    if map.len() != 1 {
        return Err(Error::Programming("vg_update expects exactly one VG".to_string()));
    }

    let k = map.keys().next().unwrap();
    let v = map
        .textmap_from_textmap(k)
        .ok_or_else(|| parse_error("malformed vg_update map"))?;

    let option = format!("vgname = \"{}\"", k);

    let mut option2 = Vec::new();
    option2.extend(b"metadata {");
    option2.extend(textmap_to_buf(v));
    option2.extend(b"}");

    let options = vec![option.as_bytes(), &option2];

    request(b"vg_update", Some(options))?;
    Ok(())
}
