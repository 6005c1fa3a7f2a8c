use std::env;
use std::net::SocketAddr;

use rdt::Config;

fn main() {
    env_logger::init();

    let local: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9090".to_string())
        .parse()
        .expect("usage: echo_server [ip:port]");

    let listener = rdt::bind(local, Config::default()).unwrap();
    println!(">>> listening on {local}");

    loop {
        let (stream, peer) = listener.accept().unwrap();
        println!(">>> accepted connection from {peer}");

        loop {
            match stream.recv() {
                Ok(payload) => {
                    println!(">>> read {} bytes from {peer}", payload.len());
                    if stream.send(&payload).is_err() {
                        break;
                    }
                }
                Err(_) => {
                    println!(">>> connection from {peer} closed");
                    break;
                }
            }
        }
    }
}
