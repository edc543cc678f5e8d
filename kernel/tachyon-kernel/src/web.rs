//! Static-content HTTP responder.
//!
//! One cooperative task: accept a TCP connection, give the request a few
//! chances to arrive, answer with `/web/index.html` from the RAM
//! filesystem (or a built-in page when the archive did not provide one),
//! close, repeat. There is deliberately no request parsing beyond waiting
//! for bytes — every request gets the same document.

use core::fmt::Write as _;

use tachyon_core::arena::Arena;
use tachyon_core::bytes::ByteBuf;
use tachyon_core::error::KResult;

use crate::boot::ROOT_FS;
use crate::net::addr::Ipv4Addr;
use crate::net::send_buf::SendBuf;
use crate::net::tcp;
use crate::sched;

/// How often `recv` is retried before answering anyway.
const RECV_RETRIES: usize = 10;
/// Sleep between `recv` retries.
const RECV_RETRY_MS: u64 = 50;
/// Sleep between served connections.
const CONN_PAUSE_MS: u64 = 100;

/// Document served when the archive carries no `/web/index.html`.
const FALLBACK_BODY: &str = "<html><body><h1>tachyon</h1></body></html>\n";

/// Path of the served document inside the RAM filesystem.
const INDEX_PATH: &str = "/web/index.html";

/// Parameters for [`task`], passed through the task context pointer.
pub struct WebContext {
    /// Address to listen on.
    pub addr: Ipv4Addr,
    /// Port to listen on.
    pub port: u16,
}

/// `fmt::Write` adapter appending into a [`ByteBuf`].
struct BufWriter<'w, 'a>(&'w mut ByteBuf<'a>);

impl core::fmt::Write for BufWriter<'_, '_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        if self.0.append(s.as_bytes()) != s.len() {
            return Err(core::fmt::Error);
        }
        Ok(())
    }
}

/// Builds the full HTTP response (headers plus body) into `resp`.
fn build_response(resp: &mut ByteBuf<'_>) {
    let mut body_backing = [0u8; 1536];
    let mut body = ByteBuf::new(&mut body_backing);

    let from_fs = {
        let mut fs = ROOT_FS.lock();
        match fs.as_mut().map(|fs| {
            let node = fs.open(INDEX_PATH)?;
            fs.read(node, &mut body, 0)
        }) {
            Some(Ok(n)) => n > 0,
            _ => false,
        }
    };
    if !from_fs {
        body.clear();
        body.append(FALLBACK_BODY.as_bytes());
    }

    let _ = write!(
        BufWriter(resp),
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        body.len()
    );
    resp.append(body.as_slice());
}

/// Serves one connection: wait for the request, respond, close.
fn handle_conn(conn: tcp::ConnId) -> KResult<()> {
    let mut req_backing = [0u8; 1024];
    let mut request = ByteBuf::new(&mut req_backing);

    for _ in 0..RECV_RETRIES {
        let n = tcp::recv(conn, &mut request)?;
        if n > 0 {
            break;
        }
        sched::sleep_ms(RECV_RETRY_MS);
    }
    crate::kdebug!("web: request of {} bytes", request.len());

    let mut resp_backing = [0u8; 2048];
    let mut response = ByteBuf::new(&mut resp_backing);
    build_response(&mut response);

    let mut send_backing = [0u8; 0x1000];
    let sent = tcp::send(
        conn,
        response.as_slice(),
        SendBuf::new(Arena::new(&mut send_backing)),
    )?;
    if sent != response.len() {
        crate::kwarn!("web: short send ({} of {})", sent, response.len());
    }

    let mut close_backing = [0u8; 512];
    tcp::close(conn, SendBuf::new(Arena::new(&mut close_backing)))
}

/// The web task body. `ctx` points at a [`WebContext`] that outlives the
/// task.
pub fn task(ctx: *mut ()) {
    // SAFETY: The context is leaked at task creation and never freed.
    let ctx = unsafe { &*(ctx as *const WebContext) };

    if let Err(e) = tcp::listen(ctx.addr, ctx.port) {
        crate::kerr!("web: listen on {}:{} failed: {}", ctx.addr, ctx.port, e);
        return;
    }
    crate::kinfo!("web: serving on {}:{}", ctx.addr, ctx.port);

    loop {
        let conn = loop {
            if let Some(conn) = tcp::accept(ctx.addr, ctx.port) {
                break conn;
            }
            sched::sleep_ms(500);
        };

        if let Err(e) = handle_conn(conn) {
            crate::kwarn!("web: connection aborted: {}", e);
        }
        sched::sleep_ms(CONN_PAUSE_MS);
    }
}
