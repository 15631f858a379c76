use clap::{App, Arg};
use flare::identity::Identity;
use flare::keys::{write_authorized_key, write_openssh_private_key, Ed25519KeyPair};
use std::fs;
use std::process::exit;

fn main() {
    let matches = App::new("Identity Generator")
        .version("1.0")
        .author("Tachyon Networking")
        .about("Generates an Ed25519 peer identity keypair.")
        .arg(
            Arg::with_name("IDENTITY")
                .help("Identity string, e.g. str:myserver or steamid:76561197960287930")
                .required(true),
        )
        .arg(
            Arg::with_name("KEY_FILE")
                .help("Private key is written here in OpenSSH format")
                .required(true),
        )
        .arg(
            Arg::with_name("PUB_FILE")
                .help("Public key is written here in authorized_keys format")
                .required(false),
        )
        .get_matches();

    let identity: Identity = match matches.value_of("IDENTITY").unwrap().parse() {
        Ok(identity) => identity,
        Err(_) => {
            eprintln!("Unparseable identity string");
            exit(1);
        }
    };

    let key_file = matches.value_of("KEY_FILE").unwrap();

    let pair = Ed25519KeyPair::generate();
    let comment = identity.to_string();

    let private_pem = write_openssh_private_key(&pair, &comment);
    if let Err(err) = fs::write(key_file, private_pem) {
        eprintln!("Failed writing {}: {}", key_file, err);
        exit(1);
    }
    println!("Wrote private key to {}", key_file);

    let public_line = write_authorized_key(&pair.public(), &comment);
    match matches.value_of("PUB_FILE") {
        Some(pub_file) => {
            if let Err(err) = fs::write(pub_file, format!("{}\n", public_line)) {
                eprintln!("Failed writing {}: {}", pub_file, err);
                exit(1);
            }
            println!("Wrote public key to {}", pub_file);
        }
        None => println!("{}", public_line),
    }
}
