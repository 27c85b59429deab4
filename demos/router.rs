//! Routing, middleware and shared state on both transports.
//!
//! The same routes are served by the blocking server on port 3000 and the
//! evented server on port 3001. Press Enter to stop both.

use std::collections::HashMap;
use std::io::BufRead;
use std::sync::{Arc, Mutex};

use trellis::{
    chain, handler, EventedHttpServer, HandlerError, HttpServer, Routing, ServerConfig,
    ServerError, StatusCode,
};

/// Registers the demo routes on any server.
fn routes<R: Routing>(server: &mut R) {
    let hits = Arc::new(Mutex::new(HashMap::<String, u64>::new()));
    let counter = hits.clone();

    server
        // Runs before every routed request.
        .middleware(handler(move |req, res, next| {
            let mut hits = counter.lock().map_err(|_| HandlerError::new("hit counter poisoned"))?;
            *hits.entry(req.path().to_owned()).or_default() += 1;
            res.set_header("x-powered-by", "trellis")?;
            Ok(next.proceed())
        }))
        .get("/", handler(|_req, res, _next| {
            Ok(res.text(StatusCode::OK, "Welcome to Trellis!"))
        }))
        .get("/hello", handler(|req, res, _next| {
            let name = req.query_param("name").unwrap_or("world");
            Ok(res.text(StatusCode::OK, format!("Hello, {}!", name)))
        }))
        .get("/hits", handler(move |_req, res, _next| {
            let hits = hits.lock().map_err(|_| HandlerError::new("hit counter poisoned"))?;
            let mut lines: Vec<_> = hits.iter().map(|(path, n)| format!("{} {}", path, n)).collect();
            lines.sort();
            Ok(res.text(StatusCode::OK, lines.join("\n")))
        }))
        .post("/echo", handler(|req, res, _next| {
            let body = req.body().to_vec();
            Ok(res.send(body))
        }))
        // Every method on every path under /admin goes through this chain.
        .middleware_at(
            "/admin",
            chain![
                handler(|req, res, next| {
                    if req.header("authorization") == Some("Bearer letmein") {
                        Ok(next.proceed())
                    } else {
                        Ok(res.text(StatusCode::UNAUTHORIZED, "Unauthorized"))
                    }
                }),
                handler(|req, res, _next| Ok(res.text(StatusCode::OK, format!("admin area: {}", req.path())))),
            ],
        );
}

fn main() -> Result<(), ServerError> {
    let config = ServerConfig::new()?;

    let mut blocking = HttpServer::new(ServerConfig {
        port: 3000,
        ..config.clone()
    });
    routes(&mut blocking);
    let bound = blocking.bind()?;
    let blocking_handle = bound.handle();
    let acceptor = bound.spawn()?;

    let mut evented = EventedHttpServer::new(ServerConfig { port: 3001, ..config });
    routes(&mut evented);
    let running = evented.start()?;

    println!("Blocking server at http://{}", blocking_handle.local_addr());
    println!("Evented server at  http://{}", running.local_addr());
    println!("Try these routes:");
    println!("  - /");
    println!("  - /hello?name=you");
    println!("  - /hits (per-path request counts)");
    println!("  - POST /echo");
    println!("  - /admin/anything (needs `Authorization: Bearer letmein`)");
    println!("Press Enter to stop.");

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    blocking_handle.stop();
    running.shutdown();
    match acceptor.join() {
        Ok(result) => result,
        Err(_) => Err(ServerError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "acceptor thread panicked",
        ))),
    }
}
