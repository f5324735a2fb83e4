//! Completion observation: `test`/`wait` on one request,
//! `test_any`/`wait_any` across a matching set, `ipeek`/`peek` for the
//! oldest completion, `iprobe`/`probe` for pending unexpected messages,
//! plus cancellation and `forget`.
//!
//! Waiting sleeps in the driver between progression passes (or
//! busy-polls under `OMX_WAITSPIN`); before each sleep the earliest
//! lib-level timer is published so the driver wakes the endpoint in
//! time for delayed acks and retransmissions.

use omx_driver::abi::{
    WaitEvent, WAIT_EVENT_STATUS_TIMEOUT, WAIT_EVENT_TIMEOUT_INFINITE,
};

use crate::{
    endpoint::Endpoint,
    error::{Error, Status},
    request::{Completion, RequestId, RequestState, RequestType},
};

impl Endpoint {
    fn timeout_to_jiffies(&self, timeout_ms: Option<u32>) -> u64 {
        match timeout_ms {
            None => WAIT_EVENT_TIMEOUT_INFINITE,
            Some(ms) => {
                let hz = u64::from(self.driver.hz());
                self.driver.jiffies() + (u64::from(ms) * hz + 1023) / 1024
            }
        }
    }

    /// Sleeps until something might have changed, or returns `false`
    /// once `expire` passed.
    fn progress_sleep(&mut self, expire: u64) -> bool {
        if self.driver.jiffies() >= expire {
            return false;
        }
        if self.config.waitspin {
            // cooperative busy poll
            return true;
        }
        self.prepare_progress_wakeup();
        let mut wait = WaitEvent {
            timeout_jiffies: expire,
            user_event_index: self.driver.user_event_count(),
            ..WaitEvent::default()
        };
        if self.driver.wait_event(&mut wait).is_err() {
            return false;
        }
        wait.status != WAIT_EVENT_STATUS_TIMEOUT
    }

    /// Extracts the completion of a done request. A request the wire is
    /// finished with is freed; one that completed early (still waiting
    /// for acks) turns into a zombie and is freed once the protocol
    /// lets go.
    fn complete_request(&mut self, id: RequestId) -> Completion {
        let status = self.reqs.req(id).status;
        self.dequeue_done_request(id);
        let req = self.reqs.req_mut(id);
        if req.state == RequestState::DONE {
            self.reqs.free(id);
        } else {
            req.state -= RequestState::DONE;
            req.state |= RequestState::ZOMBIE;
            self.zombies += 1;
        }
        status
    }

    /// Tests one request for completion without blocking.
    ///
    /// Returns `Ok(Some(_))` (and consumes the request) when done,
    /// `Ok(None)` when still in flight.
    pub fn test(&mut self, request: RequestId) -> Result<Option<Completion>, Error> {
        self.progress()?;
        let Some(req) = self.reqs.get(request) else {
            return Err(Error::BadRequest);
        };
        if req.state.contains(RequestState::DONE) {
            Ok(Some(self.complete_request(request)))
        } else {
            Ok(None)
        }
    }

    /// Waits for one request to complete, up to `timeout_ms`.
    pub fn wait(&mut self, request: RequestId, timeout_ms: Option<u32>) -> Result<Completion, Error> {
        let expire = self.timeout_to_jiffies(timeout_ms);
        loop {
            if let Some(completion) = self.test(request)? {
                return Ok(completion);
            }
            if !self.progress_sleep(expire) {
                return Err(Error::Timeout);
            }
        }
    }

    fn find_done_any(&self, match_info: u64, match_mask: u64) -> Option<RequestId> {
        // a mask pinning the context id only needs one done lane
        let covered = match_mask & self.ctxid_mask;
        if self.has_ctxids() && covered == self.ctxid_mask {
            let ctxid = self.ctxid_from_match(match_info);
            let mut cur = self.ctxids[ctxid].done_req_q.front();
            while let Some(id) = cur {
                if self.reqs.req(id).status.match_info & match_mask == match_info {
                    return Some(id);
                }
                cur = self.ctxids[ctxid].done_req_q.next_of(&self.reqs, id);
            }
            None
        } else {
            let mut cur = self.anyctxid_done_req_q.front();
            while let Some(id) = cur {
                if self.reqs.req(id).status.match_info & match_mask == match_info {
                    return Some(id);
                }
                cur = self.anyctxid_done_req_q.next_of(&self.reqs, id);
            }
            None
        }
    }

    /// Completes the oldest done request whose match information
    /// satisfies `(match_info, match_mask)`, without blocking.
    pub fn test_any(
        &mut self,
        match_info: u64,
        match_mask: u64,
    ) -> Result<Option<Completion>, Error> {
        if match_info & !match_mask != 0 {
            return Err(Error::BadMatchMask);
        }
        self.progress()?;
        match self.find_done_any(match_info, match_mask) {
            Some(id) => Ok(Some(self.complete_request(id))),
            None => Ok(None),
        }
    }

    /// Waits for any matching completion, up to `timeout_ms`.
    pub fn wait_any(
        &mut self,
        match_info: u64,
        match_mask: u64,
        timeout_ms: Option<u32>,
    ) -> Result<Completion, Error> {
        let expire = self.timeout_to_jiffies(timeout_ms);
        loop {
            if let Some(completion) = self.test_any(match_info, match_mask)? {
                return Ok(completion);
            }
            if !self.progress_sleep(expire) {
                return Err(Error::Timeout);
            }
        }
    }

    /// The oldest completed request, left on the done queue.
    pub fn ipeek(&mut self) -> Result<Option<RequestId>, Error> {
        self.progress()?;
        Ok(self.anyctxid_done_req_q.front())
    }

    /// Waits until some request completes and returns it, leaving it on
    /// the done queue.
    pub fn peek(&mut self, timeout_ms: Option<u32>) -> Result<RequestId, Error> {
        let expire = self.timeout_to_jiffies(timeout_ms);
        loop {
            if let Some(id) = self.ipeek()? {
                return Ok(id);
            }
            if !self.progress_sleep(expire) {
                return Err(Error::Timeout);
            }
        }
    }

    fn find_unexp(&self, match_info: u64, match_mask: u64) -> Option<RequestId> {
        let covered = match_mask & self.ctxid_mask;
        if self.has_ctxids() && covered == self.ctxid_mask {
            let ctxid = self.ctxid_from_match(match_info);
            let mut cur = self.ctxids[ctxid].unexp_req_q.front();
            while let Some(id) = cur {
                if self.reqs.req(id).status.match_info & match_mask == match_info {
                    return Some(id);
                }
                cur = self.ctxids[ctxid].unexp_req_q.next_of(&self.reqs, id);
            }
            None
        } else {
            let mut cur = self.anyctxid_unexp_req_q.front();
            while let Some(id) = cur {
                if self.reqs.req(id).status.match_info & match_mask == match_info {
                    return Some(id);
                }
                cur = self.anyctxid_unexp_req_q.next_of(&self.reqs, id);
            }
            None
        }
    }

    /// Checks for a pending unexpected message matching
    /// `(match_info, match_mask)` without consuming it; a subsequent
    /// matching receive is guaranteed to take the same message.
    pub fn iprobe(
        &mut self,
        match_info: u64,
        match_mask: u64,
    ) -> Result<Option<Completion>, Error> {
        if match_info & !match_mask != 0 {
            return Err(Error::BadMatchMask);
        }
        self.progress()?;
        Ok(self
            .find_unexp(match_info, match_mask)
            .map(|id| self.reqs.req(id).status))
    }

    /// Waits for a matching unexpected message, up to `timeout_ms`.
    pub fn probe(
        &mut self,
        match_info: u64,
        match_mask: u64,
        timeout_ms: Option<u32>,
    ) -> Result<Completion, Error> {
        let expire = self.timeout_to_jiffies(timeout_ms);
        loop {
            if let Some(info) = self.iprobe(match_info, match_mask)? {
                return Ok(info);
            }
            if !self.progress_sleep(expire) {
                return Err(Error::Timeout);
            }
        }
    }

    /// Attempts to cancel a request. Only a receive that has not
    /// matched and a connect that has not been answered can be
    /// cancelled; the request then completes with
    /// [`Status::Cancelled`] and must still be consumed by `test`.
    ///
    /// Returns `Ok(false)` when the request already progressed too far,
    /// and [`Error::BadRequest`] for sends, whose cancellation is not
    /// supported.
    pub fn cancel(&mut self, request: RequestId) -> Result<bool, Error> {
        let Some(req) = self.reqs.get(request) else {
            return Err(Error::BadRequest);
        };
        match req.ty {
            RequestType::Recv if req.state.contains(RequestState::RECV_NEED_MATCHING) => {
                self.recv_unpost(request);
                let req = self.reqs.req_mut(request);
                req.state -= RequestState::RECV_NEED_MATCHING;
                req.status.code = Status::Cancelled;
                self.notify_request_done(request);
                Ok(true)
            }
            RequestType::Connect
                if req.state.contains(RequestState::NEED_REPLY)
                    && !req.state.contains(RequestState::DONE) =>
            {
                self.connect_complete(request, Status::Cancelled, None);
                Ok(true)
            }
            RequestType::Recv | RequestType::RecvLarge | RequestType::Connect => Ok(false),
            _ => Err(Error::BadRequest),
        }
    }

    /// Like [`Endpoint::cancel`], but a successful cancellation frees
    /// the request immediately instead of completing it.
    pub fn cancel_notest(&mut self, request: RequestId) -> Result<bool, Error> {
        let Some(req) = self.reqs.get(request) else {
            return Err(Error::BadRequest);
        };
        match req.ty {
            RequestType::Recv if req.state.contains(RequestState::RECV_NEED_MATCHING) => {
                self.recv_unpost(request);
                self.reqs.free(request);
                Ok(true)
            }
            RequestType::Connect
                if req.state.contains(RequestState::NEED_REPLY)
                    && !req.state.contains(RequestState::DONE) =>
            {
                let pid = self.reqs.req(request).partner.expect("connect has a partner");
                self.connect_req_q.remove(&mut self.reqs, request);
                let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
                partner.connect_req_q.remove(&mut self.reqs, request);
                self.reqs.free(request);
                Ok(true)
            }
            RequestType::Recv | RequestType::RecvLarge | RequestType::Connect => Ok(false),
            _ => Err(Error::BadRequest),
        }
    }

    /// Unlinks a not-yet-matched receive from its matching lane.
    fn recv_unpost(&mut self, id: RequestId) {
        let (match_info, match_mask) = {
            let recv = self.reqs.req(id).recv();
            (recv.match_info, recv.match_mask)
        };
        let covered = match_mask & self.ctxid_mask;
        if self.has_ctxids() && covered == 0 {
            self.anyctxid_recv_req_q.remove(&mut self.reqs, id);
        } else {
            let ctxid = self.ctxid_from_match(match_info);
            self.ctxids[ctxid].recv_req_q.remove(&mut self.reqs, id);
        }
    }

    /// Detaches a request from completion reporting; the library frees
    /// it once the wire is done with it.
    pub fn forget(&mut self, request: RequestId) -> Result<(), Error> {
        let Some(req) = self.reqs.get(request) else {
            return Err(Error::BadRequest);
        };
        if !req.state.contains(RequestState::ZOMBIE) {
            self.zombify(request);
        }
        Ok(())
    }
}
