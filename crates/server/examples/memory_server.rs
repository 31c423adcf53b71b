use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use futures::StreamExt;
use http::{Method, StatusCode};
use micro_async::EventLoop;
use micro_async::timeout::with_timeout;
use micro_server::handler::make_handler;
use micro_server::protocol::RequestHeader;
use micro_server::transport::memory::{FakeRequest, MemoryTransport};
use micro_server::{HttpServer, Request, ServerError, SideTable, WsRequest};
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let event_loop = EventLoop::builder().virtual_time().build();
    let transport = MemoryTransport::new();
    let server = HttpServer::builder(transport.clone()).event_loop(event_loop.clone()).default_host("localhost").build();

    let started: Rc<RefCell<SideTable<Duration>>> = Rc::new(RefCell::new(SideTable::new()));
    let el = event_loop.clone();
    server.http_handler(make_handler(move |request: Request| {
        let el = el.clone();
        let started = Rc::clone(&started);
        async move {
            started.borrow_mut().insert(request.id(), el.now());
            if request.path() != "/echo" {
                started.borrow_mut().remove(request.id());
                request.set_status(StatusCode::NOT_FOUND)?;
                return request.end_with("no such page");
            }

            let body = with_timeout(&el, Duration::from_secs(5), "read body", {
                let request = request.clone();
                async move { Ok(request.read_body().await?) }
            })
            .await?;
            if let Some(at) = started.borrow_mut().remove(request.id()) {
                info!(exchange = %request.id(), elapsed = ?el.now().saturating_sub(at), "request body received");
            }
            request.add_header("Content-Type", mime::TEXT_PLAIN_UTF_8.as_ref())?;
            request.end_with(body)
        }
    }));

    server.websocket_handler(make_handler(|ws: WsRequest| async move {
        let mut messages = ws.text_message_stream();
        while let Some(text) = messages.next().await {
            ws.send_text_safe(&format!("echo: {}", text?));
        }
        info!(exchange = %ws.id(), "websocket session finished");
        Ok::<_, ServerError>(())
    }));

    let listening = {
        let server = server.clone();
        event_loop.spawn(async move { Ok(server.listen_on(0).await?) })
    };
    event_loop.run_until_stalled();
    info!(port = server.actual_port(), "demo server ready");

    match transport.connect_http(FakeRequest::post("/echo").body("hello over memory")) {
        Ok(response) => {
            event_loop.run_until_stalled();
            info!(response = %response, "echo request finished");
        }
        Err(e) => error!(cause = %e, "failed to connect"),
    }

    match transport.connect_http(FakeRequest::get("/missing")) {
        Ok(response) => {
            event_loop.run_until_stalled();
            info!(response = %response, "missing page request finished");
        }
        Err(e) => error!(cause = %e, "failed to connect"),
    }

    let upgrade = RequestHeader::new(Method::GET, "/chat").and_then(|header| Ok(transport.connect_websocket(header)?));
    match upgrade {
        Ok(peer) => {
            event_loop.run_until_stalled();
            peer.send_text("ping");
            event_loop.run_until_stalled();
            peer.close();
            event_loop.run_until_stalled();
            info!(received = ?peer.received(), "websocket peer finished");
        }
        Err(e) => error!(cause = %e, "failed to open websocket"),
    }

    let closer = server.clone();
    event_loop.set_timeout(Duration::from_millis(10), move || closer.close());
    event_loop.run();
    info!(outcome = ?listening.outcome(), "demo server stopped");
    event_loop.shutdown();
}
