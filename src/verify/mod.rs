pub mod gpg;
