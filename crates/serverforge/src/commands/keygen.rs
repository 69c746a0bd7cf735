use colored::Colorize;
use serverforge_ssh::KeyPairGenerator;
use serverforge_ssh::keygen::DEFAULT_RSA_BITS;

pub fn handle(rsa: bool, comment: &str) -> anyhow::Result<()> {
    let generator = KeyPairGenerator::with_comment(comment);
    let pair = if rsa {
        generator.generate_rsa(DEFAULT_RSA_BITS)?
    } else {
        generator.generate()?
    };

    print!("{}", pair.private_key);
    println!("{}", pair.public_key);
    eprintln!("{} {}", "Fingerprint:".dimmed(), pair.fingerprint);
    Ok(())
}
