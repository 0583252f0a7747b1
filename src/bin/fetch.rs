use std::env;
use std::process::exit;

use getopts::Options;

use riptide::aio::EventLoop;
use riptide::dns::{Resolver, ResolverOptions};
use riptide::http::{Body, HttpClient};

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} [options] URL", program);
    print!("{}", opts.usage(&brief));
}

/// Fetches one URL over plain HTTP and prints the body.
fn main() {
    simple_logger::init().expect("Failed to initialize logger");

    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optflag("i", "include", "print response headers before the body");
    opts.optopt(
        "n",
        "nameserver",
        "Query this DNS server instead of the resolv.conf ones (e.g. 8.8.8.8)",
        "IP",
    );

    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(err) => {
            eprintln!("{}", err);
            exit(2);
        }
    };
    if matches.opt_present("h") || matches.free.len() != 1 {
        print_usage(&program, opts);
        exit(if matches.opt_present("h") { 0 } else { 2 });
    }
    let url = matches.free[0].clone();
    let include_headers = matches.opt_present("i");

    let mut lp = match EventLoop::new() {
        Ok(lp) => lp,
        Err(err) => {
            eprintln!("could not create event loop: {}", err);
            exit(1);
        }
    };

    let resolver = match matches.opt_str("n") {
        Some(server) => match server.parse() {
            Ok(addr) => Resolver::with_name_servers(vec![std::net::SocketAddr::new(addr, 53)]),
            Err(err) => {
                eprintln!("bad nameserver address {:?}: {}", server, err);
                exit(2);
            }
        },
        None => {
            let resolver = Resolver::new();
            resolver.load(&mut lp, ResolverOptions::default(), |_, resolv_err, hosts_err| {
                if let Some(err) = resolv_err {
                    log::warn!("name-server config did not load: {}", err);
                }
                if let Some(err) = hosts_err {
                    log::warn!("hosts file did not load: {}", err);
                }
            });
            resolver
        }
    };

    let client = HttpClient::new(resolver);
    if let Err(err) = client.get(&mut lp, &url, move |_, result| match result {
        Ok(response) => {
            if include_headers {
                eprintln!("HTTP {}", response.status);
                for (name, value) in response.headers.iter() {
                    eprintln!("{}: {}", name, value);
                }
                eprintln!();
            }
            match &response.body {
                Body::Bytes(bytes) => {
                    use std::io::Write;
                    let _ = std::io::stdout().write_all(bytes);
                }
                Body::Form(pairs) => {
                    for (key, value) in pairs {
                        println!("{}={}", key, value);
                    }
                }
            }
        }
        Err(err) => {
            eprintln!("request failed: {}", err);
            exit(1);
        }
    }) {
        eprintln!("bad request: {}", err);
        exit(2);
    }

    if let Err(err) = lp.run() {
        eprintln!("event loop failed: {}", err);
        exit(1);
    }
}
