pub mod resolver;

#[cfg(test)]
pub mod testing;
