/// Build the Additional Authenticated Data binding a target database's
/// stored password ciphertext to its own row identity. Decrypting with any
/// other database's AAD must fail, which is what stops a renamed/reassigned
/// row from silently decrypting to the wrong plaintext.
pub fn database_aad(database_uid: &uuid::Uuid) -> Vec<u8> {
    format!("database:{database_uid}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aad_is_bound_to_the_uid() {
        let a = uuid::Uuid::new_v4();
        let b = uuid::Uuid::new_v4();
        assert_ne!(database_aad(&a), database_aad(&b));
    }
}
