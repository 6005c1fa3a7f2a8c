use std::env;
use std::net::SocketAddr;

use rdt::Config;

fn main() {
    env_logger::init();

    let peer: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9090".to_string())
        .parse()
        .expect("usage: echo_client [ip:port]");

    println!(">>> connecting to {peer}");
    let stream = rdt::connect(peer, Config::default()).unwrap();
    println!(">>> connected");

    stream.send(b"hello from the rdt echo client").unwrap();
    let reply = stream.recv().unwrap();
    println!(">>> echoed back: {:?}", String::from_utf8_lossy(&reply));

    stream.close();
}
