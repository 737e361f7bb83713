use crate::cmdpb::{CmdResponse, ResponseHeader};
use crate::errors::Error;

pub fn bind_term(resp: &mut CmdResponse, term: u64) {
    if term == 0 {
        return;
    }
    resp.header
        .get_or_insert_with(ResponseHeader::default)
        .current_term = term;
}

pub fn bind_error(resp: &mut CmdResponse, err: Error) {
    resp.header
        .get_or_insert_with(ResponseHeader::default)
        .error = Some(err.into());
}

pub fn new_error(err: Error) -> CmdResponse {
    let mut resp = CmdResponse::default();
    bind_error(&mut resp, err);
    resp
}

pub fn err_resp(err: Error, term: u64) -> CmdResponse {
    let mut resp = new_error(err);
    bind_term(&mut resp, term);
    resp
}
